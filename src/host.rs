//! Capabilities the engine needs from its UI host.
//!
//! Each capability is a small async trait so a host can bind them to
//! whatever it has: editor APIs, a sidecar process protocol (see
//! [`crate::stdio`]), or the in-memory [`RecordingHost`] used by tests.
//!
//! | Trait | Capability |
//! |-------|------------|
//! | [`ContentChangeListener`] | Re-render a virtual document |
//! | [`PanelHost`] | Show a document in a layout slot |
//! | [`DiagnosticsSink`] | Replace the diagnostics of a document |
//! | [`OutputSink`] | Append to the read-only output channel |
//! | [`Notifier`] | Show a user notification |

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::diagnostics::Diagnostic;
use crate::facets::{PanelSlot, StorageAddress, VirtualAddress};

#[async_trait]
pub trait ContentChangeListener: Send + Sync {
    async fn content_changed(&self, address: &VirtualAddress);
}

#[async_trait]
pub trait PanelHost: Send + Sync {
    async fn show(&self, address: &StorageAddress, slot: PanelSlot) -> Result<()>;
}

#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    /// Replace every diagnostic of `document` with `diagnostics`.
    async fn replace(&self, document: &str, diagnostics: Vec<Diagnostic>);
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn append(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, level: NoticeLevel, message: &str);
}

/// The full set of host capabilities handed to the engine.
#[derive(Clone)]
pub struct HostSurface {
    pub listener: Arc<dyn ContentChangeListener>,
    pub panels: Arc<dyn PanelHost>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    pub output: Arc<dyn OutputSink>,
    pub notifier: Arc<dyn Notifier>,
}

impl HostSurface {
    /// Bind every capability to one object implementing all of them.
    pub fn from_shared<H>(host: Arc<H>) -> Self
    where
        H: ContentChangeListener + PanelHost + DiagnosticsSink + OutputSink + Notifier + 'static,
    {
        Self {
            listener: host.clone(),
            panels: host.clone(),
            diagnostics: host.clone(),
            output: host.clone(),
            notifier: host,
        }
    }
}

/// In-memory host that records every call.
#[derive(Default)]
pub struct RecordingHost {
    changed: Mutex<Vec<VirtualAddress>>,
    shown: Mutex<Vec<(StorageAddress, PanelSlot)>>,
    diagnostics: Mutex<HashMap<String, Vec<Diagnostic>>>,
    output: Mutex<Vec<String>>,
    notices: Mutex<Vec<(NoticeLevel, String)>>,
    failing_slots: Mutex<Vec<PanelSlot>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`PanelHost::show`] fail for `slot`.
    pub async fn fail_slot(&self, slot: PanelSlot) {
        self.failing_slots.lock().await.push(slot);
    }

    pub async fn changed(&self) -> Vec<VirtualAddress> {
        self.changed.lock().await.clone()
    }

    pub async fn shown(&self) -> Vec<(StorageAddress, PanelSlot)> {
        self.shown.lock().await.clone()
    }

    pub async fn diagnostics_for(&self, document: &str) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .await
            .get(document)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn output(&self) -> Vec<String> {
        self.output.lock().await.clone()
    }

    pub async fn notices(&self) -> Vec<(NoticeLevel, String)> {
        self.notices.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.changed.lock().await.clear();
        self.shown.lock().await.clear();
        self.output.lock().await.clear();
        self.notices.lock().await.clear();
    }
}

#[async_trait]
impl ContentChangeListener for RecordingHost {
    async fn content_changed(&self, address: &VirtualAddress) {
        self.changed.lock().await.push(address.clone());
    }
}

#[async_trait]
impl PanelHost for RecordingHost {
    async fn show(&self, address: &StorageAddress, slot: PanelSlot) -> Result<()> {
        if self.failing_slots.lock().await.contains(&slot) {
            anyhow::bail!("cannot open {} in {:?}", address.document_id(), slot);
        }
        self.shown.lock().await.push((address.clone(), slot));
        Ok(())
    }
}

#[async_trait]
impl DiagnosticsSink for RecordingHost {
    async fn replace(&self, document: &str, diagnostics: Vec<Diagnostic>) {
        self.diagnostics
            .lock()
            .await
            .insert(document.to_string(), diagnostics);
    }
}

#[async_trait]
impl OutputSink for RecordingHost {
    async fn append(&self, text: &str) {
        self.output.lock().await.push(text.to_string());
    }
}

#[async_trait]
impl Notifier for RecordingHost {
    async fn notify(&self, level: NoticeLevel, message: &str) {
        self.notices.lock().await.push((level, message.to_string()));
    }
}
