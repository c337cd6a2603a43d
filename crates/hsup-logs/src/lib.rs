//! Per-executor log forwarding.
//!
//! A [`Relay`] owns the read ends of a child's stdout/stderr pipes. Each
//! pipe is pumped line by line: every line is teed to the supervisor's own
//! stdout/stderr for local visibility and buffered into a [`SinkClient`]
//! that ships framed batches to the remote sink.

pub mod client;
pub mod error;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

pub use client::{SinkClient, SinkSender};
pub use error::{LogsError, Result};

/// Which local stream a pump mirrors to.
#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Per-executor stdout/stderr relay.
pub struct Relay {
    client: SinkClient,
    pumps: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Creates a relay shipping to `sink_url`, attributing messages to
    /// `name` (the dyno name, e.g. `web.1`).
    ///
    /// # Errors
    ///
    /// Returns an error if the sink client cannot be configured.
    pub fn new(sink_url: &str, name: &str) -> Result<Self> {
        Ok(Self {
            client: SinkClient::new(sink_url, name)?,
            pumps: Vec::new(),
        })
    }

    /// Starts pumping a child stdout pipe.
    pub fn run_stdout(&mut self, reader: impl AsyncRead + Unpin + Send + 'static) {
        self.spawn_pump(reader, Stream::Stdout);
    }

    /// Starts pumping a child stderr pipe.
    pub fn run_stderr(&mut self, reader: impl AsyncRead + Unpin + Send + 'static) {
        self.spawn_pump(reader, Stream::Stderr);
    }

    fn spawn_pump(&mut self, reader: impl AsyncRead + Unpin + Send + 'static, stream: Stream) {
        let tx = self.client.sender();
        self.pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        tee_local(stream, &line).await;
                        tx.buffer_message(&line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("log pump read error: {e}");
                        break;
                    }
                }
            }
        }));
    }

    /// Waits for both pumps to hit EOF, then drains and closes the sink
    /// client so buffered logs are delivered.
    pub async fn stop(self) {
        for pump in self.pumps {
            if let Err(e) = pump.await {
                tracing::warn!("log pump task failed: {e}");
            }
        }
        self.client.close().await;
    }
}

async fn tee_local(stream: Stream, line: &str) {
    let data = format!("{line}\n");
    match stream {
        Stream::Stdout => {
            let _ = tokio::io::stdout().write_all(data.as_bytes()).await;
        }
        Stream::Stderr => {
            let _ = tokio::io::stderr().write_all(data.as_bytes()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_pumps_until_eof_and_stops() {
        let mut relay = Relay::new("http://127.0.0.1:9/logs", "web.1").unwrap();

        let (stdout_tx, stdout_rx) = tokio::io::duplex(256);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(256);
        relay.run_stdout(stdout_rx);
        relay.run_stderr(stderr_rx);

        let mut stdout_tx = stdout_tx;
        stdout_tx.write_all(b"out line\n").await.unwrap();
        drop(stdout_tx);
        drop(stderr_tx);

        // stop() joins the pumps and drains the client; an unreachable sink
        // must not hang it.
        tokio::time::timeout(std::time::Duration::from_secs(5), relay.stop())
            .await
            .expect("relay stop should not hang");
    }
}
