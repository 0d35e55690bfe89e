use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, warn};

use sizeflow_infra::ingest;
use sizeflow_messaging::{decode, DecodeError, VendorPayloadKind};

use crate::app::errors::{decode_error_to_response, json_error, store_error_to_response};
use crate::app::services::AppServices;

/// Vendor webhook. The `Content-Type` header picks the decoder.
///
/// Notifications without a customer message (delivery or read receipts) are
/// acknowledged and ignored so the vendor does not retry them.
pub async fn inbound(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Some(kind) = VendorPayloadKind::from_content_type(content_type) else {
        return json_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            format!("unsupported content type {content_type:?}"),
        );
    };

    let received_at = Utc::now();
    let message = match decode(kind, &body, received_at) {
        Ok(message) => message,
        Err(DecodeError::NoMessage) => {
            debug!(?kind, "webhook without a message ignored");
            return Json(json!({ "ok": true, "ignored": true })).into_response();
        }
        Err(e) => {
            warn!(?kind, error = %e, "rejecting webhook payload");
            return decode_error_to_response(e);
        }
    };

    match ingest(services.store.as_ref(), &message, received_at).await {
        Ok(ingested) => Json(json!({
            "ok": true,
            "duplicate": ingested.duplicate,
            "parsed": ingested.parsed,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "failed to store inbound message");
            store_error_to_response(e)
        }
    }
}
