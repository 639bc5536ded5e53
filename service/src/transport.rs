//! Line-oriented request/response framing over a byte stream.
//!
//! The admin endpoint terminates neither replies nor prompts, so a reply is
//! everything that arrives after a command until the stream has been quiet
//! for the settle window.

use crate::error::ConnectionError;
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

/// A reply still growing past this is treated as a broken exchange; a full
/// `plys` on a busy server is far smaller.
const MAX_REPLY_BYTES: usize = 1024 * 1024;

pub struct LineTransport<S> {
    stream: S,
    settle: Duration,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, settle: Duration) -> Self {
        Self { stream, settle }
    }

    /// Writes `data` exactly as given, line terminator included.
    pub async fn send_raw(&mut self, data: &str) -> Result<(), ConnectionError> {
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        debug!("Sending command: {}", line);
        self.send_raw(&format!("{}\n", line)).await
    }

    /// Waits up to `wait` for the first bytes of a reply, then collects
    /// until the stream stays quiet for the settle window.
    ///
    /// A reply that does not go quiet before the size cap or the deadline
    /// fails with `ConnectionLost`: its tail would otherwise be read as the
    /// answer to the next command.
    pub async fn read_reply(&mut self, wait: Duration) -> Result<String, ConnectionError> {
        let started = Instant::now();
        let mut chunk = [0u8; 4096];
        let mut data = Vec::new();

        let first = match timeout(wait, self.stream.read(&mut chunk)).await {
            Err(_) => return Err(ConnectionError::Timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(0)) => {
                return Err(ConnectionError::ConnectionLost(
                    "closed by server".to_string(),
                ))
            }
            Ok(Ok(n)) => n,
        };
        data.extend_from_slice(&chunk[..first]);

        let mut settled = false;
        while data.len() < MAX_REPLY_BYTES && started.elapsed() < wait + self.settle {
            match timeout(self.settle, self.stream.read(&mut chunk)).await {
                // The next exchange reports the closed stream.
                Err(_) | Ok(Ok(0)) => {
                    settled = true;
                    break;
                }
                Ok(Ok(n)) => data.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        if !settled {
            warn!("Reply still streaming after {} bytes, dropping it", data.len());
            return Err(ConnectionError::ConnectionLost(format!(
                "reply did not end after {} bytes",
                data.len()
            )));
        }

        let reply = String::from_utf8_lossy(&data).trim().to_string();
        debug!("Received {} bytes", data.len());
        Ok(reply)
    }

    /// Reads whatever greeting the server prints on connect, if any.
    pub async fn read_banner(&mut self, wait: Duration) -> Result<Option<String>, ConnectionError> {
        match self.read_reply(wait).await {
            Ok(banner) => Ok(Some(banner)),
            Err(ConnectionError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Error closing transport: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    const SETTLE: Duration = Duration::from_millis(50);

    #[tokio::test(start_paused = true)]
    async fn test_command_and_reply() {
        let mock = Builder::new()
            .write(b"plys\n")
            .read(b"Players connected (0):\r\n")
            .build();
        let mut transport = LineTransport::new(mock, SETTLE);

        transport.send_line("plys").await.unwrap();
        let reply = transport.read_reply(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, "Players connected (0):");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_split_across_chunks_is_joined() {
        let mock = Builder::new()
            .write(b"plys\n")
            .read(b"Players connected (1):\n")
            .wait(Duration::from_millis(10))
            .read(b"1: 7, Ann, Akua, 10.0.0.1|1\n")
            .build();
        let mut transport = LineTransport::new(mock, SETTLE);

        transport.send_line("plys").await.unwrap();
        let reply = transport.read_reply(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, "Players connected (1):\n1: 7, Ann, Akua, 10.0.0.1|1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_endless_reply_fails_the_exchange() {
        let (client, mut server) = duplex(64 * 1024);
        let mut transport = LineTransport::new(client, SETTLE);

        // Keeps talking well past the reply deadline, never pausing for a
        // whole settle window.
        let chatter = tokio::spawn(async move {
            for n in 0..100 {
                let line = format!("log line {}\n", n);
                if server.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let result = transport.read_reply(Duration::from_millis(200)).await;
        assert!(
            matches!(result, Err(ConnectionError::ConnectionLost(ref reason)) if reason.contains("did not end")),
            "unexpected result: {:?}",
            result
        );

        drop(transport);
        chatter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_a_timeout() {
        let mock = Builder::new().wait(Duration::from_secs(30)).build();
        let mut transport = LineTransport::new(mock, SETTLE);

        let result = transport.read_reply(Duration::from_secs(2)).await;
        assert_eq!(result, Err(ConnectionError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_is_connection_lost() {
        let mock = Builder::new().build();
        let mut transport = LineTransport::new(mock, SETTLE);

        let result = transport.read_reply(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ConnectionError::ConnectionLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_banner_is_not_an_error() {
        let mock = Builder::new().wait(Duration::from_secs(30)).build();
        let mut transport = LineTransport::new(mock, SETTLE);

        let banner = transport.read_banner(Duration::from_secs(1)).await.unwrap();
        assert_eq!(banner, None);
    }
}
