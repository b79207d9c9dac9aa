//! Transport — duplex byte-stream connection to the rendezvous server
//!
//! Connect with a caller-supplied timeout; once connected, send/receive are
//! each bounded by the 1 s socket timeout. No retry policy lives here.

pub mod codec;

use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

pub struct Transport {
    stream: Option<TcpStream>,
    /// Lines drained but not yet consumed (a burst can carry several).
    pending: VecDeque<String>,
    io_timeout: Duration,
}

impl Transport {
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            stream: None,
            pending: VecDeque::new(),
            io_timeout,
        }
    }

    /// Open the connection. Returns `Ok(false)` when the attempt did not
    /// complete within `connect_timeout`; refusals surface as errors.
    pub async fn connect(&mut self, addr: &str, connect_timeout: Duration) -> io::Result<bool> {
        match time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => Ok(false),
            Ok(Err(e)) => Err(e),
            Ok(Ok(stream)) => {
                trace!(%addr, "transport connected");
                self.stream = Some(stream);
                self.pending.clear();
                Ok(true)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Idempotent; releases the stream.
    pub fn close(&mut self) {
        self.stream = None;
        self.pending.clear();
    }

    /// Encode `text + CRLF` and write it fully within the socket timeout.
    pub async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport closed")
        })?;
        let bytes = codec::encode_line(text);
        let timeout = self.io_timeout;
        time::timeout(timeout, stream.write_all(&bytes))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))??;
        trace!(line = text, "transport sent");
        Ok(())
    }

    /// Read one message: drain all immediately-available bytes, decode, and
    /// return the first line; further lines from the burst queue up for the
    /// next call. Returns the empty string when the transport is absent.
    pub async fn read_message(&mut self) -> io::Result<String> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(line);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(String::new());
        };

        let mut buf = vec![0u8; 4096];
        let n = time::timeout(self.io_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "receive timed out"))??;
        if n == 0 {
            self.close();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote closed the connection",
            ));
        }

        let mut data = buf[..n].to_vec();
        // Drain until the socket reports no immediately-available bytes.
        loop {
            if data.len() >= codec::MAX_BURST_SIZE {
                break;
            }
            match stream.try_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        for line in codec::split_lines(&codec::decode(&data)) {
            self.pending.push_back(line);
        }
        Ok(self.pending.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn transport() -> Transport {
        Transport::new(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_connect_and_close_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut t = transport();
        assert!(!t.is_connected());
        assert!(t.connect(&addr, Duration::from_secs(2)).await.unwrap());
        assert!(t.is_connected());

        t.close();
        t.close();
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_connect_timeout_returns_false() {
        // Non-routable address; the attempt either hangs until the timeout
        // or is refused outright, never connects.
        let mut t = transport();
        let result = t
            .connect("10.255.255.1:6911", Duration::from_millis(100))
            .await;
        assert!(matches!(result, Ok(false) | Err(_)));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_write_when_closed_is_rejected() {
        let mut t = transport();
        let err = t.write_line("113 1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_read_when_absent_returns_empty() {
        let mut t = transport();
        assert_eq!(t.read_message().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_roundtrip_and_burst_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Two messages in one write burst.
            stream.write_all(b"211 1\r\n212 1 0.34\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
        });

        let mut t = transport();
        assert!(t.connect(&addr, Duration::from_secs(2)).await.unwrap());
        assert_eq!(t.read_message().await.unwrap(), "211 1");
        assert_eq!(t.read_message().await.unwrap(), "212 1 0.34");
        t.write_line("113 1 0.34").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_times_out_on_silence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut t = transport();
        assert!(t.connect(&addr, Duration::from_secs(2)).await.unwrap());
        let err = t.read_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
