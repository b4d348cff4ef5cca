//! The Event Channel Listener (spec §4.6): a long-lived server-sent-events
//! style stream that tells the engine "something changed" without carrying
//! any payload of its own. Every `data:` line (and the initial connect)
//! triggers a `full_sync()`; the connection auto-reconnects on any failure
//! after a fixed 5-second delay, unbounded.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use interrupt_support::Interruptee;

use crate::db::LocalStore;
use crate::http::SyncHttpClient;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Invoked on every transition that should kick off a sync: the initial
/// connect, and every `data:` line thereafter.
pub type SyncTrigger = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct EventChannelListener {
    store: Arc<LocalStore>,
    http: Arc<SyncHttpClient>,
    on_event: SyncTrigger,
}

impl EventChannelListener {
    pub fn new(store: Arc<LocalStore>, http: Arc<SyncHttpClient>, on_event: SyncTrigger) -> Self {
        Self { store, http, on_event }
    }

    /// Runs the Disconnected/Connecting/Connected state machine until
    /// `interruptee` reports a shutdown. Intended to be spawned as a
    /// background task; never returns under normal operation.
    pub async fn run(&self, connected: &std::sync::atomic::AtomicBool, interruptee: &dyn Interruptee) {
        use std::sync::atomic::Ordering;
        loop {
            if interruptee.was_interrupted() {
                connected.store(false, Ordering::SeqCst);
                return;
            }
            match self.http.open_event_stream().await {
                Ok(resp) => {
                    connected.store(true, Ordering::SeqCst);
                    self.store.notify();
                    log::info!("event channel connected");
                    (self.on_event)().await;
                    self.consume(resp, interruptee).await;
                }
                Err(e) => {
                    log::warn!("event channel connect failed: {e}");
                }
            }
            connected.store(false, Ordering::SeqCst);
            self.store.notify();
            if interruptee.was_interrupted() {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// Reads the response body line by line until the stream ends, errors,
    /// or the process is shutting down.
    async fn consume(&self, resp: reqwest::Response, interruptee: &dyn Interruptee) {
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        loop {
            if interruptee.was_interrupted() {
                return;
            }
            let chunk = match stream.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    log::warn!("event channel stream error: {e}");
                    return;
                }
                None => {
                    log::debug!("event channel stream ended");
                    return;
                }
            };
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line = buf.drain(..=pos).collect::<Vec<u8>>();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\r', '\n']);
                self.handle_line(line).await;
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            log::debug!("event channel data line: {}", rest.trim());
            (self.on_event)().await;
        } else if line.starts_with(':') {
            log::trace!("event channel heartbeat");
        }
    }
}
