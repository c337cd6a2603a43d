//! Batching client for the remote log sink.
//!
//! Messages are framed in syslog style with an octet-count prefix and
//! buffered until either 100 KiB accumulate or 250 ms pass, then shipped as
//! one POST body. The buffer is bounded: when the executor outruns the sink
//! the newest message is counted and discarded instead of blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{LogsError, Result};

/// Flush when this much framed data has accumulated.
const REQUEST_SIZE_TRIGGER: usize = 100 * 1024;

/// Flush at least this often while messages are pending.
const FLUSH_PERIOD: Duration = Duration::from_millis(250);

/// Bound on messages waiting to be batched.
const BUFFER_DEPTH: usize = 1024;

/// Syslog priority for app output (local0.info).
const PRIORITY: u8 = 134;

/// Handle to a running sink client.
pub struct SinkClient {
    sender: SinkSender,
    shipper: JoinHandle<()>,
}

/// Cheap handle for feeding a [`SinkClient`] from pump tasks.
#[derive(Clone)]
pub struct SinkSender {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
    proc_id: Arc<str>,
}

impl SinkSender {
    /// Buffers one line of process output.
    ///
    /// Never blocks: when the buffer is full the message is dropped and
    /// counted.
    pub fn buffer_message(&self, line: &str) {
        let frame = frame(PRIORITY, &self.proc_id, line);
        if self.tx.try_send(frame).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl SinkClient {
    /// Starts a client shipping to `url`, stamping each message with
    /// `proc_id` (e.g. `web.1`).
    ///
    /// # Errors
    ///
    /// Returns an error if the sink URL is not a valid HTTP(S) endpoint.
    pub fn new(url: &str, proc_id: &str) -> Result<Self> {
        let url: reqwest::Url = url
            .parse()
            .map_err(|e| LogsError::BadSinkUrl(format!("{url:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LogsError::BadSinkUrl(format!(
                "{url}: expected an http(s) endpoint"
            )));
        }

        let (tx, rx) = mpsc::channel(BUFFER_DEPTH);
        let shipper = tokio::spawn(ship(url, rx));

        Ok(Self {
            sender: SinkSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                proc_id: Arc::from(proc_id),
            },
            shipper,
        })
    }

    /// Buffers one line of process output; see [`SinkSender::buffer_message`].
    pub fn buffer_message(&self, line: &str) {
        self.sender.buffer_message(line);
    }

    /// Returns a handle suitable for feeding from other tasks.
    #[must_use]
    pub fn sender(&self) -> SinkSender {
        self.sender.clone()
    }

    /// Messages discarded due to back-pressure so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.sender.dropped.load(Ordering::Relaxed)
    }

    /// Drains buffered messages and stops the shipper.
    pub async fn close(self) {
        let SinkClient { sender, shipper } = self;
        let dropped = sender.dropped.load(Ordering::Relaxed);
        drop(sender);
        if let Err(e) = shipper.await {
            tracing::warn!("log shipper task failed: {e}");
        }
        if dropped > 0 {
            tracing::warn!(dropped, "log messages discarded under back-pressure");
        }
    }
}

/// Renders one syslog message:
/// `<prio>1 TIMESTAMP host app PROCID - - MSG`.
fn frame(priority: u8, proc_id: &str, line: &str) -> Bytes {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    Bytes::from(format!("<{priority}>1 {ts} host app {proc_id} - - {line}"))
}

async fn ship(url: reqwest::Url, mut rx: mpsc::Receiver<Bytes>) {
    let client = reqwest::Client::new();
    let mut batch = BytesMut::new();
    let mut count: u64 = 0;
    let mut ticker = tokio::time::interval(FLUSH_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        append_frame(&mut batch, &msg);
                        count += 1;
                        if batch.len() >= REQUEST_SIZE_TRIGGER {
                            post(&client, &url, &mut batch, &mut count).await;
                        }
                    }
                    None => {
                        // Sender gone: final drain.
                        post(&client, &url, &mut batch, &mut count).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                post(&client, &url, &mut batch, &mut count).await;
            }
        }
    }
}

/// Appends one octet-counted frame to the batch.
fn append_frame(batch: &mut BytesMut, msg: &Bytes) {
    batch.put_slice(format!("{} ", msg.len()).as_bytes());
    batch.put_slice(msg);
}

async fn post(client: &reqwest::Client, url: &reqwest::Url, batch: &mut BytesMut, count: &mut u64) {
    if batch.is_empty() {
        return;
    }
    let body = batch.split().freeze();
    let msg_count = std::mem::take(count);

    let result = client
        .post(url.clone())
        .header("Content-Type", "application/logplex-1")
        .header("Logplex-Msg-Count", msg_count.to_string())
        .body(body)
        .send()
        .await;
    match result {
        Ok(resp) if !resp.status().is_success() => {
            tracing::warn!(status = %resp.status(), "log sink rejected batch");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("could not deliver log batch: {e}"),
    }
}
