use anyhow::{Context, Result};
use capture::CaptureConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use supervisor::SupervisorConfig;

const DEFAULT_FILE: &str = "fuzzdeck.yaml";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct CaptureSection {
    pub sniff: Option<bool>,
    pub snaplen: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ToolsSection {
    pub radamsa: Option<PathBuf>,
    pub nmap: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub runs_dir: Option<PathBuf>,
    pub seeds_dir: Option<PathBuf>,
    pub heartbeat_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub telemetry_capacity: Option<usize>,
    pub telemetry_history: Option<usize>,
    pub capture: Option<CaptureSection>,
    pub tools: Option<ToolsSection>,
}

impl Config {
    pub fn supervisor(&self) -> SupervisorConfig {
        let d = SupervisorConfig::default();
        let cap = self.capture.clone().unwrap_or_default();
        let tools = self.tools.clone().unwrap_or_default();
        SupervisorConfig {
            runs_dir: self.runs_dir.clone().unwrap_or(d.runs_dir),
            heartbeat: self.heartbeat_ms.map(Duration::from_millis).unwrap_or(d.heartbeat),
            stop_grace: self.stop_grace_ms.map(Duration::from_millis).unwrap_or(d.stop_grace),
            telemetry_capacity: self.telemetry_capacity.unwrap_or(d.telemetry_capacity),
            telemetry_history: self.telemetry_history.unwrap_or(d.telemetry_history),
            capture: CaptureConfig {
                sniff: cap.sniff.unwrap_or(d.capture.sniff),
                snaplen: cap.snaplen.unwrap_or(d.capture.snaplen),
            },
            radamsa: tools.radamsa,
            nmap: tools.nmap,
        }
    }

    pub fn seeds_dir(&self) -> PathBuf {
        self.seeds_dir.clone().unwrap_or_else(|| PathBuf::from("seeds"))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.runs_dir.clone().unwrap_or_else(|| SupervisorConfig::default().runs_dir)
    }
}

/// Reads `path`, or `./fuzzdeck.yaml` when it exists. No file means defaults;
/// an unreadable or malformed file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.yaml");
        fs::write(
            &p,
            "runs_dir: /tmp/r\nheartbeat_ms: 250\ncapture:\n  sniff: false\ntools:\n  nmap: /opt/nmap/bin/nmap\n",
        )
        .unwrap();
        let cfg = load_config(Some(&p)).unwrap();
        let sup = cfg.supervisor();
        assert_eq!(sup.runs_dir, PathBuf::from("/tmp/r"));
        assert_eq!(sup.heartbeat, Duration::from_millis(250));
        assert!(!sup.capture.sniff);
        assert_eq!(sup.capture.snaplen, 65535);
        assert_eq!(sup.stop_grace, Duration::from_secs(5));
        assert_eq!(sup.nmap, Some(PathBuf::from("/opt/nmap/bin/nmap")));
        assert_eq!(cfg.seeds_dir(), PathBuf::from("seeds"));
    }

    #[test]
    fn unknown_keys_and_missing_files_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.yaml");
        fs::write(&p, "run_dir: typo\n").unwrap();
        assert!(load_config(Some(&p)).is_err());
        assert!(load_config(Some(&dir.path().join("absent.yaml"))).is_err());
    }
}
