//! Run-scoped traffic capture.
//!
//! A [`CaptureSink`] owns one classic pcap file for the lifetime of a run.
//! With live sniffing it drains a datalink channel on the run's interface;
//! without it, engines report what they send through a [`CaptureRecorder`]
//! and the sink stores synthesized frames, so traces exist even when raw
//! capture is not permitted.

pub mod frame;
pub mod pcap;
mod sniff;

use fuzzdeck_core::{RunId, Transport};
use pcap::PcapWriter;
use pnet::datalink::{self, Channel, Config, NetworkInterface};
use std::fs::File;
use std::io::{self, BufWriter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use thiserror::Error;

pub use pcap::{read_summary, TraceSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Open a datalink channel and record the wire. Needs raw capture rights.
    pub sniff: bool,
    pub snaplen: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig { sniff: true, snaplen: 65535 }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("interface {iface} not found")]
    IfaceUnavailable { iface: String },
    #[error("capture on {iface} not permitted: {source}")]
    PermissionDenied {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a closed sink left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStats {
    pub path: PathBuf,
    pub frames: u64,
    pub live: bool,
}

pub(crate) struct Shared {
    writer: Mutex<PcapWriter<BufWriter<File>>>,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PcapWriter<BufWriter<File>>> {
        match self.writer.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn write(&self, frame: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.lock().write_frame(SystemTime::now(), frame) {
            tracing::warn!(error = %e, "dropping frame, trace write failed");
        }
    }

    fn finish(&self) -> io::Result<u64> {
        self.closed.store(true, Ordering::Release);
        let mut w = self.lock();
        w.flush()?;
        w.get_ref().get_ref().sync_all()?;
        Ok(w.frames())
    }
}

pub struct CaptureSink {
    run_id: RunId,
    path: PathBuf,
    shared: Arc<Shared>,
    sniffer: Option<sniff::Sniffer>,
}

impl CaptureSink {
    /// Creates the trace at `path` and, when sniffing, starts draining
    /// `iface`. If the channel cannot be opened the header-only trace is
    /// still flushed before the error is returned.
    pub fn open(config: &CaptureConfig, iface: &str, run_id: RunId, path: &Path) -> Result<Self, CaptureError> {
        let nic = if config.sniff {
            let found = datalink::interfaces().into_iter().find(|i| i.name == iface);
            Some(found.ok_or_else(|| CaptureError::IfaceUnavailable { iface: iface.to_string() })?)
        } else {
            None
        };
        Self::open_on(config, nic, run_id, path, sniff::datalink_channel)
    }

    fn open_on<F>(
        config: &CaptureConfig,
        nic: Option<NetworkInterface>,
        run_id: RunId,
        path: &Path,
        opener: F,
    ) -> Result<Self, CaptureError>
    where
        F: FnOnce(&NetworkInterface, Config) -> io::Result<Channel>,
    {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = PcapWriter::new(BufWriter::new(File::create(path)?), config.snaplen)?;
        let shared = Arc::new(Shared { writer: Mutex::new(writer), closed: AtomicBool::new(false) });
        let mut sink = CaptureSink { run_id, path: path.to_path_buf(), shared, sniffer: None };

        if let Some(nic) = nic {
            let started = sniff::open_receiver(&nic, opener)
                .and_then(|rx| Ok(sniff::Sniffer::spawn(rx, sink.shared.clone(), run_id)?));
            match started {
                Ok(s) => sink.sniffer = Some(s),
                Err(e) => {
                    let _ = sink.shared.finish();
                    return Err(e);
                }
            }
            tracing::debug!(%run_id, iface = %nic.name, path = %sink.path.display(), "live capture started");
        } else {
            tracing::debug!(%run_id, path = %sink.path.display(), "capture recording synthesized frames");
        }
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_live(&self) -> bool {
        self.sniffer.is_some()
    }

    pub fn frames(&self) -> u64 {
        self.shared.lock().frames()
    }

    /// Handle engines use to report sent and received payloads. Reports are
    /// ignored while the sink records the wire itself.
    pub fn recorder(&self) -> CaptureRecorder {
        CaptureRecorder { shared: if self.is_live() { None } else { Some(self.shared.clone()) } }
    }

    /// Stops the sniffer and makes the trace durable. Later recorder calls
    /// are dropped.
    pub fn close(mut self) -> Result<CaptureStats, CaptureError> {
        let live = self.is_live();
        if let Some(mut s) = self.sniffer.take() {
            s.halt();
        }
        let frames = self.shared.finish()?;
        tracing::debug!(run_id = %self.run_id, frames, "capture closed");
        Ok(CaptureStats { path: self.path.clone(), frames, live })
    }
}

impl Drop for CaptureSink {
    fn drop(&mut self) {
        if let Some(mut s) = self.sniffer.take() {
            s.halt();
        }
        if !self.shared.closed.load(Ordering::Acquire) {
            let _ = self.shared.finish();
        }
    }
}

#[derive(Clone, Default)]
pub struct CaptureRecorder {
    shared: Option<Arc<Shared>>,
}

impl CaptureRecorder {
    /// A recorder that stores nothing.
    pub fn disabled() -> Self {
        CaptureRecorder { shared: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_some()
    }

    pub fn record_payload(&self, transport: Transport, src: SocketAddr, dst: SocketAddr, payload: &[u8]) {
        let Some(shared) = &self.shared else { return };
        if let Some(frame) = frame::synthesize(transport, src, dst, payload) {
            shared.write(&frame);
        }
    }

    pub fn record_ip_packet(&self, packet: &[u8]) {
        let Some(shared) = &self.shared else { return };
        if let Some(frame) = frame::wrap_ip(packet) {
            shared.write(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::datalink::dummy;

    fn recording() -> CaptureConfig {
        CaptureConfig { sniff: false, snaplen: 65535 }
    }

    #[test]
    fn empty_trace_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcaps").join("run.pcap");
        let sink = CaptureSink::open(&recording(), "lo", RunId::new(), &path).unwrap();
        let stats = sink.close().unwrap();
        assert_eq!(stats.frames, 0);
        let summary = read_summary(&path).unwrap();
        assert_eq!(summary.frames, 0);
        assert_eq!(summary.link_type, pcap::LINKTYPE_ETHERNET);
    }

    #[test]
    fn recorder_writes_synthesized_frames_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.pcap");
        let sink = CaptureSink::open(&recording(), "lo", RunId::new(), &path).unwrap();
        let rec = sink.recorder();
        assert!(rec.is_enabled());
        let a: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        rec.record_payload(Transport::Udp, a, b, b"hello");
        rec.record_payload(Transport::Tcp, b, a, b"world");
        assert_eq!(sink.close().unwrap().frames, 2);

        rec.record_payload(Transport::Udp, a, b, b"late");
        assert_eq!(read_summary(&path).unwrap().frames, 2);
    }

    #[test]
    fn unknown_interface_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.pcap");
        let cfg = CaptureConfig { sniff: true, snaplen: 65535 };
        match CaptureSink::open(&cfg, "definitely-not-a-nic0", RunId::new(), &path) {
            Err(CaptureError::IfaceUnavailable { iface }) => assert_eq!(iface, "definitely-not-a-nic0"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("capture opened on a missing interface"),
        }
        assert!(!path.exists());
    }

    #[test]
    fn permission_failure_still_leaves_a_valid_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.pcap");
        let cfg = CaptureConfig { sniff: true, snaplen: 65535 };
        let denied = |_: &NetworkInterface, _: Config| -> io::Result<Channel> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "no CAP_NET_RAW"))
        };
        let res = CaptureSink::open_on(&cfg, Some(dummy::dummy_interface(0)), RunId::new(), &path, denied);
        assert!(matches!(res, Err(CaptureError::PermissionDenied { .. })));
        assert_eq!(read_summary(&path).unwrap().frames, 0);
    }

    #[test]
    fn live_sink_drains_channel_and_ignores_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.pcap");
        let cfg = CaptureConfig { sniff: true, snaplen: 65535 };
        let mut dcfg = dummy::Config::default();
        let inject = dcfg.inject_handle().unwrap();
        let opener = move |i: &NetworkInterface, _: Config| dummy::channel(i, dcfg);

        let sink = CaptureSink::open_on(&cfg, Some(dummy::dummy_interface(0)), RunId::new(), &path, opener).unwrap();
        assert!(sink.is_live());
        assert!(!sink.recorder().is_enabled());
        inject.send(Ok(vec![0u8; 60].into_boxed_slice())).unwrap();
        inject.send(Ok(vec![1u8; 42].into_boxed_slice())).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while sink.frames() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        // A receive error ends the sniffer loop.
        inject.send(Err(io::Error::new(io::ErrorKind::Other, "end of test traffic"))).unwrap();

        let stats = sink.close().unwrap();
        assert!(stats.live);
        assert_eq!(stats.frames, 2);
        assert_eq!(read_summary(&path).unwrap().captured_bytes, 102);
    }

    #[test]
    fn close_does_not_wait_forever_on_a_stuck_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.pcap");
        let cfg = CaptureConfig { sniff: true, snaplen: 65535 };
        let mut dcfg = dummy::Config::default();
        let inject = dcfg.inject_handle().unwrap();
        let opener = move |i: &NetworkInterface, _: Config| dummy::channel(i, dcfg);

        let sink = CaptureSink::open_on(&cfg, Some(dummy::dummy_interface(0)), RunId::new(), &path, opener).unwrap();
        inject.send(Ok(vec![7u8; 60].into_boxed_slice())).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while sink.frames() < 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        // The dummy receiver blocks until the next injection, ignoring read_timeout.
        let started = std::time::Instant::now();
        let stats = sink.close().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(stats.frames, 1);

        // Frames read by the detached thread after close are not written.
        inject.send(Ok(vec![8u8; 60].into_boxed_slice())).unwrap();
        inject.send(Err(io::Error::new(io::ErrorKind::Other, "end of test traffic"))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(read_summary(&path).unwrap().frames, 1);
    }
}
