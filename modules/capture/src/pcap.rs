//! Classic libpcap file format (microsecond timestamps).

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const LINKTYPE_ETHERNET: u32 = 1;
const MAGIC: u32 = 0xa1b2_c3d4;
const MAGIC_SWAPPED: u32 = 0xd4c3_b2a1;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

pub struct PcapWriter<W: Write> {
    inner: W,
    snaplen: u32,
    frames: u64,
}

impl<W: Write> PcapWriter<W> {
    /// Writes the global header right away so even an untouched trace is valid.
    pub fn new(mut inner: W, snaplen: u32) -> io::Result<Self> {
        let mut hdr = Vec::with_capacity(GLOBAL_HEADER_LEN);
        hdr.extend_from_slice(&MAGIC.to_le_bytes());
        hdr.extend_from_slice(&2u16.to_le_bytes());
        hdr.extend_from_slice(&4u16.to_le_bytes());
        hdr.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        hdr.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        hdr.extend_from_slice(&snaplen.to_le_bytes());
        hdr.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        inner.write_all(&hdr)?;
        Ok(PcapWriter { inner, snaplen, frames: 0 })
    }

    pub fn write_frame(&mut self, ts: SystemTime, data: &[u8]) -> io::Result<()> {
        let since = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
        let incl = data.len().min(self.snaplen as usize);
        let mut rec = [0u8; RECORD_HEADER_LEN];
        rec[0..4].copy_from_slice(&(since.as_secs() as u32).to_le_bytes());
        rec[4..8].copy_from_slice(&since.subsec_micros().to_le_bytes());
        rec[8..12].copy_from_slice(&(incl as u32).to_le_bytes());
        rec[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
        self.inner.write_all(&rec)?;
        self.inner.write_all(&data[..incl])?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSummary {
    pub link_type: u32,
    pub snaplen: u32,
    pub frames: u64,
    pub captured_bytes: u64,
}

/// Validates a trace file and counts its records. Fails on a bad magic
/// number or a record that runs past the end of the file.
pub fn read_summary(path: &Path) -> io::Result<TraceSummary> {
    let mut r = BufReader::new(File::open(path)?);
    let mut hdr = [0u8; GLOBAL_HEADER_LEN];
    r.read_exact(&mut hdr)?;
    let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let swap = match magic {
        MAGIC => false,
        MAGIC_SWAPPED => true,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "not a pcap file")),
    };
    let field = |b: &[u8]| {
        let v = [b[0], b[1], b[2], b[3]];
        if swap { u32::from_be_bytes(v) } else { u32::from_le_bytes(v) }
    };
    let snaplen = field(&hdr[16..20]);
    let link_type = field(&hdr[20..24]);

    let mut frames = 0u64;
    let mut captured_bytes = 0u64;
    let mut rec = [0u8; RECORD_HEADER_LEN];
    loop {
        match r.read_exact(&mut rec) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let incl = field(&rec[8..12]) as u64;
        let copied = io::copy(&mut (&mut r).take(incl), &mut io::sink())?;
        if copied != incl {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated pcap record"));
        }
        frames += 1;
        captured_bytes += incl;
    }
    Ok(TraceSummary { link_type, snaplen, frames, captured_bytes })
}
