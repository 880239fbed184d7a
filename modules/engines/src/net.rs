//! Socket plumbing shared by the mutation and session engines.

use capture::CaptureRecorder;
use fuzzdeck_core::Transport;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

const MAX_REPLY: usize = 65535;

pub(crate) async fn within<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?
}

/// One open conversation with the DUT.
pub(crate) enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[derive(Clone)]
pub(crate) struct Link {
    pub target: SocketAddr,
    pub transport: Transport,
    /// Local address to bind so traffic leaves through the run's interface.
    pub source: Option<IpAddr>,
    pub io_timeout: Duration,
    pub reply_timeout: Duration,
    pub recorder: CaptureRecorder,
}

impl Link {
    fn bind_addr(&self) -> SocketAddr {
        let ip = match (self.source, self.target.ip()) {
            (Some(src), dst) if src.is_ipv4() == dst.is_ipv4() => src,
            (_, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (_, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, 0)
    }

    pub async fn open(&self) -> io::Result<Conn> {
        let local = self.bind_addr();
        match self.transport {
            Transport::Tcp => {
                let sock = if local.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
                if !local.ip().is_unspecified() {
                    sock.bind(local)?;
                }
                let stream = within(self.io_timeout, sock.connect(self.target)).await?;
                stream.set_nodelay(true)?;
                Ok(Conn::Tcp(stream))
            }
            Transport::Udp => {
                let sock = UdpSocket::bind(local).await?;
                sock.connect(self.target).await?;
                Ok(Conn::Udp(sock))
            }
        }
    }

    pub async fn send(&self, conn: &mut Conn, payload: &[u8]) -> io::Result<()> {
        let local = match conn {
            Conn::Tcp(s) => {
                within(self.io_timeout, s.write_all(payload)).await?;
                s.local_addr()?
            }
            Conn::Udp(s) => {
                within(self.io_timeout, s.send(payload)).await?;
                s.local_addr()?
            }
        };
        self.recorder.record_payload(self.transport, local, self.target, payload);
        Ok(())
    }

    /// Waits up to the reply window for an answer. Silence, resets and
    /// refusals are not failures here.
    pub async fn recv(&self, conn: &mut Conn) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; MAX_REPLY];
        let (res, local) = match conn {
            Conn::Tcp(s) => (tokio::time::timeout(self.reply_timeout, s.read(&mut buf)).await, s.local_addr()),
            Conn::Udp(s) => (tokio::time::timeout(self.reply_timeout, s.recv(&mut buf)).await, s.local_addr()),
        };
        match res {
            Ok(Ok(n)) if n > 0 => {
                buf.truncate(n);
                if let Ok(local) = local {
                    self.recorder.record_payload(self.transport, self.target, local, &buf);
                }
                Some(buf)
            }
            Ok(Err(e)) => {
                tracing::trace!(error = %e, "no reply");
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_link_sends_and_reads_echo() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });
        let link = Link {
            target,
            transport: Transport::Udp,
            source: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            io_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(1),
            recorder: CaptureRecorder::disabled(),
        };
        let mut conn = link.open().await.unwrap();
        link.send(&mut conn, b"ping").await.unwrap();
        assert_eq!(link.recv(&mut conn).await.as_deref(), Some(&b"ping"[..]));
    }

    #[tokio::test]
    async fn tcp_connect_to_closed_port_fails() {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = l.local_addr().unwrap();
        drop(l);
        let link = Link {
            target,
            transport: Transport::Tcp,
            source: None,
            io_timeout: Duration::from_millis(500),
            reply_timeout: Duration::from_millis(50),
            recorder: CaptureRecorder::disabled(),
        };
        assert!(link.open().await.is_err());
    }
}
