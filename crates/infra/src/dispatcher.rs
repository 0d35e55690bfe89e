//! Outbound dispatcher: at most one delivered send per `(order, template)`.
//!
//! The dispatcher checks the outbox, performs the send (a vendor call, or a
//! local artifact in dry-run mode) and hands back the attempt record. It does
//! not commit delivered records: the engine writes them in the same
//! transaction as the state change they belong to, so that a concurrent tick
//! never sees a sent template without the matching state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use sizeflow_core::{MessageId, OrderId, PhoneNumber};
use sizeflow_messaging::{MessageTemplate, TemplateName};

use crate::store::{EventLogRepo, EventRecord, OutboxRecord, OutboxRepo, OutboxStatus, Store, StoreResult};
use crate::vendor::{MessagingVendor, VendorError, VendorMessageId};

/// How messages leave the process. Chosen once at construction.
#[derive(Clone)]
pub enum DispatchMode {
    /// Write a JSON artifact under `artifact_dir` instead of calling the vendor.
    DryRun { artifact_dir: PathBuf },
    Live { vendor: Arc<dyn MessagingVendor> },
}

impl DispatchMode {
    pub fn dry_run(artifact_dir: impl Into<PathBuf>) -> Self {
        DispatchMode::DryRun {
            artifact_dir: artifact_dir.into(),
        }
    }

    pub fn live(vendor: Arc<dyn MessagingVendor>) -> Self {
        DispatchMode::Live { vendor }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, DispatchMode::DryRun { .. })
    }

    fn vendor_name(&self) -> &'static str {
        match self {
            DispatchMode::DryRun { .. } => "dry_run",
            DispatchMode::Live { vendor } => vendor.name(),
        }
    }
}

impl std::fmt::Debug for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::DryRun { artifact_dir } => f
                .debug_struct("DryRun")
                .field("artifact_dir", artifact_dir)
                .finish(),
            DispatchMode::Live { vendor } => {
                f.debug_struct("Live").field("vendor", &vendor.name()).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pre-approved template that reopens an expired session window.
    pub session_template: String,
    pub template_language: String,
    /// Upper bound for each vendor call.
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            session_template: "size_check_reopen".to_string(),
            template_language: "ru".to_string(),
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_session_template(mut self, name: impl Into<String>) -> Self {
        self.session_template = name.into();
        self
    }

    pub fn with_template_language(mut self, language: impl Into<String>) -> Self {
        self.template_language = language.into();
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

/// One message to send for an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub order_id: OrderId,
    pub template: TemplateName,
    pub to: PhoneNumber,
    pub text: String,
    pub variables: JsonValue,
}

impl OutboundRequest {
    pub fn new(order_id: OrderId, to: PhoneNumber, message: &MessageTemplate) -> Self {
        Self {
            order_id,
            template: message.name(),
            to,
            text: message.render(),
            variables: message.variables(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A `SENT`/`DRY_RUN` row already exists; nothing was sent.
    AlreadyDelivered(OutboxRecord),
    /// Sent now. Neither `record` nor `prior` is persisted yet.
    Delivered {
        record: OutboxRecord,
        prior: Vec<OutboxRecord>,
    },
    /// The attempt failed. The `ERROR` record is not yet persisted.
    Failed {
        record: OutboxRecord,
        reason: String,
        /// Worth retrying on a later tick.
        transient: bool,
        prior: Vec<OutboxRecord>,
    },
}

impl Dispatch {
    pub fn record(&self) -> &OutboxRecord {
        match self {
            Dispatch::AlreadyDelivered(r) | Dispatch::Delivered { record: r, .. } => r,
            Dispatch::Failed { record, .. } => record,
        }
    }

    /// Vendor calls made before the final one in this dispatch (the send
    /// rejected for the session window and the reopen template).
    pub fn prior(&self) -> &[OutboxRecord] {
        match self {
            Dispatch::AlreadyDelivered(_) => &[],
            Dispatch::Delivered { prior, .. } | Dispatch::Failed { prior, .. } => prior,
        }
    }

    pub fn status(&self) -> OutboxStatus {
        self.record().status
    }
}

/// Outcome of the vendor calls for one request.
struct LiveSend {
    result: Result<VendorMessageId, VendorError>,
    prior: Vec<OutboxRecord>,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    mode: DispatchMode,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, mode: DispatchMode, config: DispatcherConfig) -> Self {
        Self { store, mode, config }
    }

    pub fn mode(&self) -> &DispatchMode {
        &self.mode
    }

    /// Send `request` unless the template was already delivered to this order.
    ///
    /// Vendor and artifact failures come back as [`Dispatch::Failed`]; only
    /// store failures are errors.
    #[instrument(
        skip(self, request),
        fields(order_id = %request.order_id, template = %request.template),
        err
    )]
    pub async fn send(&self, request: &OutboundRequest) -> StoreResult<Dispatch> {
        if let Some(existing) = self
            .store
            .delivered(&request.order_id, request.template.as_str())
            .await?
        {
            debug!(status = existing.status.as_str(), "template already delivered");
            return Ok(Dispatch::AlreadyDelivered(existing));
        }

        let id = MessageId::new();
        let mut payload = self.payload(request);
        let mut prior = Vec::new();

        // (status, or the failure reason and whether it is transient)
        let outcome = match &self.mode {
            DispatchMode::DryRun { artifact_dir } => {
                match write_artifact(artifact_dir, id, request, Utc::now()).await {
                    Ok(path) => {
                        payload["artifact"] = json!(path.display().to_string());
                        Ok(OutboxStatus::DryRun)
                    }
                    Err(e) => {
                        payload["error"] = json!({
                            "kind": "artifact_io",
                            "message": e.to_string(),
                            "transient": true,
                        });
                        Err((format!("dry-run artifact not written: {e}"), true))
                    }
                }
            }
            DispatchMode::Live { vendor } => {
                let sent = self.send_live(vendor.as_ref(), request).await?;
                prior = sent.prior;
                match sent.result {
                    Ok(vendor_id) => {
                        payload["vendor_message_id"] = json!(vendor_id);
                        Ok(OutboxStatus::Sent)
                    }
                    Err(e) => {
                        // A window that stays closed after the reopen is retried like any
                        // other transient failure.
                        let transient = e.is_transient() || e.is_session_window();
                        payload["error"] = error_json(&e, transient);
                        Err((e.to_string(), transient))
                    }
                }
            }
        };

        let status = match &outcome {
            Ok(status) => *status,
            Err(_) => OutboxStatus::Error,
        };
        let record = OutboxRecord {
            id,
            order_id: request.order_id.clone(),
            to_phone: request.to.clone(),
            template: request.template.as_str().to_string(),
            payload,
            status,
            created_at: Utc::now(),
        };

        Ok(match outcome {
            Ok(_) => {
                info!(status = status.as_str(), prior = prior.len(), "message dispatched");
                Dispatch::Delivered { record, prior }
            }
            Err((reason, transient)) => {
                warn!(%reason, transient, "message dispatch failed");
                Dispatch::Failed {
                    record,
                    reason,
                    transient,
                    prior,
                }
            }
        })
    }

    fn payload(&self, request: &OutboundRequest) -> JsonValue {
        json!({
            "to": request.to.as_str(),
            "text": request.text,
            "template_id": request.template.as_str(),
            "variables": request.variables,
            "vendor": self.mode.vendor_name(),
        })
    }

    /// Vendor send with the session-window fallback: on a window error, send
    /// the pre-approved template and retry once. Every call but the last is
    /// returned as a `prior` attempt record.
    async fn send_live(&self, vendor: &dyn MessagingVendor, request: &OutboundRequest) -> StoreResult<LiveSend> {
        let first = self.bounded(vendor.send_text(&request.to, &request.text)).await;
        let err = match first {
            Err(e) if e.is_session_window() => e,
            result => {
                return Ok(LiveSend {
                    result,
                    prior: Vec::new(),
                })
            }
        };

        let mut rejected = self.payload(request);
        rejected["error"] = error_json(&err, true);
        let mut prior = vec![OutboxRecord {
            id: MessageId::new(),
            order_id: request.order_id.clone(),
            to_phone: request.to.clone(),
            template: request.template.as_str().to_string(),
            payload: rejected,
            status: OutboxStatus::Error,
            created_at: Utc::now(),
        }];

        warn!(error = %err, "session window closed; sending reopen template");
        let reopen = self
            .bounded(vendor.send_template(
                &request.to,
                &self.config.session_template,
                &self.config.template_language,
                None,
            ))
            .await;

        let mut reopen_payload = json!({
            "to": request.to.as_str(),
            "template_id": self.config.session_template,
            "language": self.config.template_language,
            "vendor": vendor.name(),
            "reopens": request.template.as_str(),
        });
        match &reopen {
            Ok(vendor_id) => reopen_payload["vendor_message_id"] = json!(vendor_id),
            Err(e) => reopen_payload["error"] = error_json(e, e.is_transient()),
        }
        prior.push(OutboxRecord {
            id: MessageId::new(),
            order_id: request.order_id.clone(),
            to_phone: request.to.clone(),
            template: self.config.session_template.clone(),
            payload: reopen_payload,
            status: if reopen.is_ok() {
                OutboxStatus::Sent
            } else {
                OutboxStatus::Error
            },
            created_at: Utc::now(),
        });

        self.store
            .append_event(&EventRecord::new(
                Some(request.order_id.clone()),
                "wa_session_reopen",
                json!({
                    "template": self.config.session_template,
                    "language": self.config.template_language,
                    "trigger": err.to_json(),
                    "ok": reopen.is_ok(),
                    "error": reopen.as_ref().err().map(VendorError::to_json),
                }),
                Utc::now(),
            ))
            .await?;

        if let Err(reopen_err) = reopen {
            warn!(error = %reopen_err, "reopen template failed");
            return Ok(LiveSend {
                result: Err(err),
                prior,
            });
        }
        let result = self.bounded(vendor.send_text(&request.to, &request.text)).await;
        Ok(LiveSend { result, prior })
    }

    async fn bounded<F>(&self, call: F) -> Result<VendorMessageId, VendorError>
    where
        F: std::future::Future<Output = Result<VendorMessageId, VendorError>>,
    {
        match tokio::time::timeout(self.config.send_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(VendorError::Timeout(self.config.send_timeout)),
        }
    }
}

fn error_json(err: &VendorError, transient: bool) -> JsonValue {
    let mut json = err.to_json();
    json["transient"] = json!(transient);
    json
}

/// `<dir>/<YYYYMMDD>/wa_send_<id>.json`
async fn write_artifact(
    dir: &std::path::Path,
    id: MessageId,
    request: &OutboundRequest,
    at: DateTime<Utc>,
) -> std::io::Result<PathBuf> {
    let day_dir = dir.join(at.format("%Y%m%d").to_string());
    tokio::fs::create_dir_all(&day_dir).await?;

    let path = day_dir.join(format!("wa_send_{id}.json"));
    let artifact = json!({
        "id": id.to_string(),
        "order_id": request.order_id.as_str(),
        "to": request.to.as_str(),
        "text": request.text,
        "template_id": request.template.as_str(),
        "variables": request.variables,
        "vendor": "dry_run",
        "dry_run": true,
        "created_at": at.to_rfc3339(),
    });
    let bytes = serde_json::to_vec_pretty(&artifact)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}
