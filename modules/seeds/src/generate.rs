use crate::SeedError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedKind {
    Http,
    Dns,
    Ssh,
    Custom,
}

impl SeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedKind::Http => "http",
            SeedKind::Dns => "dns",
            SeedKind::Ssh => "ssh",
            SeedKind::Custom => "custom",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            SeedKind::Http => "http",
            SeedKind::Dns => "dns",
            SeedKind::Ssh => "txt",
            SeedKind::Custom => "bin",
        }
    }

    pub(crate) fn default_name(&self) -> String {
        format!("{}_seed.{}", self.as_str(), self.extension())
    }
}

impl fmt::Display for SeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to generate. Unset fields take per-kind defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRequest {
    pub kind: Option<SeedKind>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub qname: Option<String>,
    #[serde(default)]
    pub payload_hex: Option<String>,
}

impl SeedRequest {
    pub fn new(kind: SeedKind) -> Self {
        SeedRequest { kind: Some(kind), ..Default::default() }
    }
}

pub const SSH_BANNER: &[u8] = b"SSH-2.0-fuzzdeck_0.1\r\n";
const CUSTOM_PATTERN: &[u8] = b"FUZZDECK-SEED\x00\x00\x00\x00\x00\x00\x00\x00";

/// Payload bytes and the description stored for them.
pub(crate) fn payload(kind: SeedKind, req: &SeedRequest) -> Result<(Vec<u8>, String), SeedError> {
    Ok(match kind {
        SeedKind::Http => {
            let host = req.host.as_deref().unwrap_or("dut");
            if host.is_empty() || host.contains(['\r', '\n']) {
                return Err(SeedError::Validation(format!("invalid host {host:?}")));
            }
            let body = format!("GET / HTTP/1.1\r\nHost: {host}\r\nUser-Agent: fuzzdeck\r\nConnection: close\r\n\r\n");
            (body.into_bytes(), format!("HTTP GET for {host}"))
        }
        SeedKind::Dns => {
            let qname = req.qname.as_deref().unwrap_or("example.com");
            let q = udp_probe::dns_query(qname, rand::thread_rng().gen())
                .map_err(|e| SeedError::Validation(e.to_string()))?;
            (q, format!("DNS A query for {qname}"))
        }
        SeedKind::Ssh => (SSH_BANNER.to_vec(), "SSH client banner".to_string()),
        SeedKind::Custom => match req.payload_hex.as_deref() {
            Some(h) => {
                let clean: String = h.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = hex::decode(&clean).map_err(|e| SeedError::Validation(format!("payload_hex: {e}")))?;
                (bytes, "custom payload".to_string())
            }
            None => (CUSTOM_PATTERN.to_vec(), "default custom pattern".to_string()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_uses_host() {
        let req = SeedRequest { host: Some("printer.lan".into()), ..SeedRequest::new(SeedKind::Http) };
        let (bytes, desc) = payload(SeedKind::Http, &req).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: printer.lan\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(desc.contains("printer.lan"));
    }

    #[test]
    fn custom_hex_and_default() {
        let req = SeedRequest { payload_hex: Some("de ad be ef".into()), ..SeedRequest::new(SeedKind::Custom) };
        assert_eq!(payload(SeedKind::Custom, &req).unwrap().0, vec![0xde, 0xad, 0xbe, 0xef]);
        let (def, _) = payload(SeedKind::Custom, &SeedRequest::new(SeedKind::Custom)).unwrap();
        assert!(def.starts_with(b"FUZZDECK-SEED"));
        assert_eq!(def.len(), 13 + 8);
    }

    #[test]
    fn bad_hex_is_rejected() {
        let req = SeedRequest { payload_hex: Some("xyz".into()), ..SeedRequest::new(SeedKind::Custom) };
        assert!(matches!(payload(SeedKind::Custom, &req), Err(SeedError::Validation(_))));
    }

    #[test]
    fn dns_query_names_qname() {
        let req = SeedRequest { qname: Some("dut.local".into()), ..SeedRequest::new(SeedKind::Dns) };
        let (q, _) = payload(SeedKind::Dns, &req).unwrap();
        assert_eq!(&q[12..16], b"\x03dut");
    }
}
