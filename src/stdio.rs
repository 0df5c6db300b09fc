//! Newline-delimited JSON bridge for hosts driving the engine as a child
//! process.
//!
//! Inbound envelopes are read one per line from stdin; replies and
//! notifications are written one per line to stdout. Host capabilities
//! become outbound notifications:
//!
//! | Capability | Envelope |
//! |------------|----------|
//! | content changed | `refresh {address}` |
//! | show document | `showDocument {address, slot}` |
//! | diagnostics | `diagnostics {document, diagnostics}` |
//! | output | `output {text}` |
//! | notification | `notify {level, message}` |
//!
//! When `channel.request_timeout_secs` is set, `showDocument` is sent as
//! a correlated request and the host's answer decides whether the facet
//! counts as opened.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::backend::HttpBackend;
use crate::channel::{run_message_loop, CorrelationChannel, Envelope, MessagePort};
use crate::config::Config;
use crate::diagnostics::Diagnostic;
use crate::error::ErrorPayload;
use crate::facets::{PanelSlot, StorageAddress, VirtualAddress};
use crate::history::TestStateStore;
use crate::host::{
    ContentChangeListener, DiagnosticsSink, HostSurface, NoticeLevel, Notifier, OutputSink,
    PanelHost,
};
use crate::messages::WorkbenchMessages;
use crate::orchestrator::Workbench;
use crate::store::SqliteKvStore;

/// Writes each envelope as one JSON line.
pub struct LinePort<W> {
    writer: Mutex<W>,
}

impl<W> LinePort<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> MessagePort for LinePort<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn post(&self, envelope: Envelope) -> Result<()> {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Forward every parseable line of `reader` to `tx` until EOF.
///
/// A malformed line that still names a `requestId` is answered with an
/// `error` envelope on `replies` so the sender's request settles.
pub async fn read_envelopes<R>(
    reader: R,
    tx: mpsc::Sender<Envelope>,
    replies: Arc<dyn MessagePort>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => {
                if tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("ignoring malformed envelope: {}", e);
                if let Some(request_id) = raw_request_id(&line) {
                    let payload = ErrorPayload::new(format!("malformed envelope: {e}"));
                    if let Err(e) = replies.post(Envelope::error(request_id, &payload)).await {
                        tracing::error!("failed to reject malformed envelope: {:#}", e);
                    }
                }
            }
        }
    }
    Ok(())
}

fn raw_request_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get("requestId")? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Host capabilities expressed as outbound envelopes.
pub struct NotificationHost {
    port: Arc<dyn MessagePort>,
    channel: Option<Arc<CorrelationChannel>>,
}

impl NotificationHost {
    pub fn new(port: Arc<dyn MessagePort>) -> Self {
        Self { port, channel: None }
    }

    /// Send `showDocument` as a correlated request over `channel`.
    pub fn with_acknowledged_show(mut self, channel: Arc<CorrelationChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    async fn send(&self, kind: &str, payload: serde_json::Value) {
        if let Err(e) = self.port.post(Envelope::notification(kind, payload)).await {
            tracing::error!(kind, "failed to post notification: {:#}", e);
        }
    }
}

#[async_trait]
impl ContentChangeListener for NotificationHost {
    async fn content_changed(&self, address: &VirtualAddress) {
        self.send("refresh", json!({ "address": address.to_string() }))
            .await;
    }
}

#[async_trait]
impl PanelHost for NotificationHost {
    async fn show(&self, address: &StorageAddress, slot: PanelSlot) -> Result<()> {
        let payload = json!({ "address": address.document_id(), "slot": slot });
        match &self.channel {
            Some(channel) => {
                channel.request("showDocument", payload).await?;
            }
            None => {
                self.port
                    .post(Envelope::notification("showDocument", payload))
                    .await?
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DiagnosticsSink for NotificationHost {
    async fn replace(&self, document: &str, diagnostics: Vec<Diagnostic>) {
        self.send(
            "diagnostics",
            json!({ "document": document, "diagnostics": diagnostics }),
        )
        .await;
    }
}

#[async_trait]
impl OutputSink for NotificationHost {
    async fn append(&self, text: &str) {
        self.send("output", json!({ "text": text })).await;
    }
}

#[async_trait]
impl Notifier for NotificationHost {
    async fn notify(&self, level: NoticeLevel, message: &str) {
        self.send("notify", json!({ "level": level, "message": message }))
            .await;
    }
}

/// Serve the engine over stdin/stdout until stdin closes.
pub async fn serve(config: &Config) -> Result<()> {
    let backend = HttpBackend::new(&config.backend)?;
    let kv = SqliteKvStore::connect(&config.state.path)
        .await
        .context("Failed to open state database")?;

    let port: Arc<dyn MessagePort> = Arc::new(LinePort::new(tokio::io::stdout()));
    let mut channel = CorrelationChannel::new(port.clone());
    if let Some(secs) = config.channel.request_timeout_secs {
        channel = channel.with_timeout(Duration::from_secs(secs));
    }
    let channel = Arc::new(channel);

    let mut host = NotificationHost::new(port.clone());
    if config.channel.request_timeout_secs.is_some() {
        host = host.with_acknowledged_show(channel.clone());
    }

    let workbench = Workbench::new(
        config,
        Arc::new(backend),
        TestStateStore::new(Arc::new(kv)),
        HostSurface::from_shared(Arc::new(host)),
    )?;
    let handler = Arc::new(WorkbenchMessages::new(Arc::new(workbench)));

    let (tx, rx) = mpsc::channel(64);
    let replies = port.clone();
    let reader = tokio::spawn(async move {
        if let Err(e) = read_envelopes(BufReader::new(tokio::io::stdin()), tx, replies).await {
            tracing::error!("stdin reader stopped: {:#}", e);
        }
    });

    tracing::info!(backend = %config.backend.base_url, "serving on stdio");
    run_message_loop(rx, handler, port, Some(channel.clone())).await;
    channel.close().await;
    reader.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_skips_garbage() {
        let input = b"{\"type\":\"listEndpoints\",\"requestId\":\"1\"}\n\nnot json\n{\"type\":\"x\"}\n";
        let (tx, mut rx) = mpsc::channel(8);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        read_envelopes(&input[..], tx, Arc::new(reply_tx)).await.unwrap();
        assert!(reply_rx.try_recv().is_err());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, "listEndpoints");
        assert_eq!(first.request_id.as_deref(), Some("1"));
        assert_eq!(rx.recv().await.unwrap().kind, "x");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_request_is_answered_with_error() {
        let input = b"{\"requestId\":\"9\",\"payload\":{}}\n{\"type\":7,\"requestId\":10}\n{\"type\":\"ok\"}\n";
        let (tx, mut rx) = mpsc::channel(8);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        read_envelopes(&input[..], tx, Arc::new(reply_tx)).await.unwrap();

        let first = reply_rx.recv().await.unwrap();
        assert_eq!(first.kind, "error");
        assert_eq!(first.request_id.as_deref(), Some("9"));
        assert!(first.payload["message"]
            .as_str()
            .unwrap()
            .starts_with("malformed envelope"));
        assert_eq!(reply_rx.recv().await.unwrap().request_id.as_deref(), Some("10"));
        assert!(reply_rx.try_recv().is_err());

        assert_eq!(rx.recv().await.unwrap().kind, "ok");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn port_writes_one_line_per_envelope() {
        let port = LinePort::new(Vec::new());
        port.post(Envelope::notification("refresh", json!({ "address": "epw://a/config" })))
            .await
            .unwrap();
        port.post(Envelope::success("getConfig", "7", json!({}))).await.unwrap();

        let text = String::from_utf8(port.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Envelope = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.kind, "getConfig-success");
        assert_eq!(second.request_id.as_deref(), Some("7"));
    }
}
