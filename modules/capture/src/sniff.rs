use crate::{CaptureError, Shared};
use fuzzdeck_core::RunId;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll interval of the blocking receive.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// How long `halt` waits for a receiver that does not honor `READ_TIMEOUT`.
const HALT_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn config() -> Config {
    Config { read_timeout: Some(READ_TIMEOUT), ..Default::default() }
}

pub(crate) fn open_receiver<F>(iface: &NetworkInterface, opener: F) -> Result<Box<dyn DataLinkReceiver>, CaptureError>
where
    F: FnOnce(&NetworkInterface, Config) -> io::Result<Channel>,
{
    match opener(iface, config()) {
        Ok(Channel::Ethernet(_tx, rx)) => Ok(rx),
        Ok(_) => Err(CaptureError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("non-ethernet channel for {}", iface.name),
        ))),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            Err(CaptureError::PermissionDenied { iface: iface.name.clone(), source: e })
        }
        Err(e) => Err(CaptureError::Io(e)),
    }
}

/// Default opener used outside tests.
pub(crate) fn datalink_channel(iface: &NetworkInterface, cfg: Config) -> io::Result<Channel> {
    datalink::channel(iface, cfg)
}

pub(crate) struct Sniffer {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    /// Disconnects when the thread exits.
    done: mpsc::Receiver<()>,
}

impl Sniffer {
    pub(crate) fn spawn(mut rx: Box<dyn DataLinkReceiver>, shared: Arc<Shared>, run_id: RunId) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let (done_tx, done) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new().name(format!("sniff-{run_id}")).spawn(move || {
            let _done = done_tx;
            while !flag.load(Ordering::Relaxed) {
                match rx.next() {
                    Ok(frame) => shared.write(frame),
                    Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => continue,
                    Err(e) => {
                        tracing::warn!(%run_id, error = %e, "capture receive failed, sniffer exiting");
                        break;
                    }
                }
            }
        })?;
        Ok(Sniffer { stop, thread: Some(thread), done })
    }

    /// Signals the thread and joins it, waiting at most `HALT_TIMEOUT`. A
    /// thread stuck in its receiver is detached; frames it reads after the
    /// sink closed are dropped. Returns whether the thread was joined. Safe to
    /// call more than once.
    pub(crate) fn halt(&mut self) -> bool {
        self.stop.store(true, Ordering::Relaxed);
        let Some(t) = self.thread.take() else { return true };
        match self.done.recv_timeout(HALT_TIMEOUT) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout_ms = HALT_TIMEOUT.as_millis() as u64, "sniffer did not stop, detaching it");
                false
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if t.join().is_err() {
                    tracing::warn!("sniffer thread panicked");
                }
                true
            }
        }
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.halt();
    }
}
