//! Vendor webhook payloads normalised to one [`InboundMessage`] shape.
//!
//! Two vendors deliver customer messages:
//!
//! - the form-encoded webhook (`From`, `To`, `Body`, optional `Timestamp`),
//!   with phone numbers prefixed `whatsapp:`;
//! - the Cloud API JSON webhook
//!   (`entry[0].changes[0].value.messages[0]`).
//!
//! The caller states which shape it received ([`VendorPayloadKind`]); nothing
//! here guesses. A payload that does not match its declared shape is a
//! [`DecodeError`], never an empty message.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sizeflow_core::{DomainError, PhoneNumber};

/// Which decoder to apply to a webhook body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorPayloadKind {
    TwilioForm,
    CloudApiJson,
}

impl VendorPayloadKind {
    /// Select a decoder from an HTTP `Content-Type` header value.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/x-www-form-urlencoded" => Some(Self::TwilioForm),
            "application/json" => Some(Self::CloudApiJson),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed {kind:?} body: {message}")]
    Malformed {
        kind: VendorPayloadKind,
        message: String,
    },

    #[error("body does not look like a {0:?} payload")]
    UnrecognizedShape(VendorPayloadKind),

    /// A well-formed notification without a customer message (delivery
    /// receipts, read statuses).
    #[error("payload carries no message")]
    NoMessage,

    #[error(transparent)]
    InvalidPhone(#[from] DomainError),
}

/// A customer message in vendor-neutral form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: PhoneNumber,
    /// Our business number as reported by the vendor; may be empty.
    pub to: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Stable identity used to drop webhook redeliveries.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.from
        )
    }
}

/// Decode a webhook body.
///
/// `received_at` is used when the vendor omits a timestamp.
pub fn decode(
    kind: VendorPayloadKind,
    body: &[u8],
    received_at: DateTime<Utc>,
) -> Result<InboundMessage, DecodeError> {
    match kind {
        VendorPayloadKind::TwilioForm => decode_form(body, received_at),
        VendorPayloadKind::CloudApiJson => decode_cloud(body, received_at),
    }
}

const VENDOR_PREFIX: &str = "whatsapp:";

fn strip_prefix(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix(VENDOR_PREFIX).unwrap_or(raw)
}

#[derive(Debug, Deserialize)]
struct FormPayload {
    #[serde(rename = "From")]
    from: Option<String>,
    #[serde(rename = "To", default)]
    to: String,
    #[serde(rename = "Body")]
    body: Option<String>,
    #[serde(rename = "Timestamp")]
    timestamp: Option<String>,
}

fn decode_form(body: &[u8], received_at: DateTime<Utc>) -> Result<InboundMessage, DecodeError> {
    let kind = VendorPayloadKind::TwilioForm;
    let form: FormPayload = serde_urlencoded::from_bytes(body).map_err(|e| DecodeError::Malformed {
        kind,
        message: e.to_string(),
    })?;

    let Some(from) = form.from.filter(|f| !f.trim().is_empty()) else {
        return Err(DecodeError::UnrecognizedShape(kind));
    };
    if form.body.is_none() {
        return Err(DecodeError::UnrecognizedShape(kind));
    }

    let timestamp = form
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    Ok(InboundMessage {
        from: PhoneNumber::parse(strip_prefix(&from))?,
        to: strip_prefix(&form.to).to_string(),
        text: form.body.unwrap_or_default().trim().to_string(),
        timestamp,
    })
}

#[derive(Debug, Deserialize)]
struct CloudEnvelope {
    entry: Vec<CloudEntry>,
}

#[derive(Debug, Deserialize)]
struct CloudEntry {
    #[serde(default)]
    changes: Vec<CloudChange>,
}

#[derive(Debug, Deserialize)]
struct CloudChange {
    #[serde(default)]
    value: CloudValue,
}

#[derive(Debug, Default, Deserialize)]
struct CloudValue {
    #[serde(default)]
    messages: Vec<CloudMessage>,
    metadata: Option<CloudMetadata>,
}

#[derive(Debug, Deserialize)]
struct CloudMetadata {
    #[serde(default)]
    display_phone_number: String,
}

#[derive(Debug, Deserialize)]
struct CloudMessage {
    from: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<CloudText>,
    button: Option<CloudButton>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct CloudButton {
    #[serde(default)]
    text: String,
}

fn decode_cloud(body: &[u8], received_at: DateTime<Utc>) -> Result<InboundMessage, DecodeError> {
    let kind = VendorPayloadKind::CloudApiJson;
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|e| DecodeError::Malformed {
        kind,
        message: e.to_string(),
    })?;
    let envelope: CloudEnvelope =
        serde_json::from_value(value).map_err(|_| DecodeError::UnrecognizedShape(kind))?;

    let change = envelope
        .entry
        .into_iter()
        .next()
        .and_then(|entry| entry.changes.into_iter().next())
        .ok_or(DecodeError::UnrecognizedShape(kind))?;

    let CloudValue { messages, metadata } = change.value;
    let message = messages.into_iter().next().ok_or(DecodeError::NoMessage)?;

    let text = match message.kind.as_deref() {
        Some("text") => message.text.map(|t| t.body).unwrap_or_default(),
        _ => match (message.button, message.text) {
            (Some(button), _) => button.text,
            (None, Some(text)) => text.body,
            (None, None) => String::new(),
        },
    };

    let timestamp = message
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    Ok(InboundMessage {
        from: PhoneNumber::parse(&message.from)?,
        to: metadata.map(|m| m.display_phone_number).unwrap_or_default(),
        text: text.trim().to_string(),
        timestamp,
    })
}

/// Unix seconds (Cloud API) or RFC 3339.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn content_type_selects_decoder() {
        assert_eq!(
            VendorPayloadKind::from_content_type("application/x-www-form-urlencoded; charset=utf-8"),
            Some(VendorPayloadKind::TwilioForm)
        );
        assert_eq!(
            VendorPayloadKind::from_content_type("Application/JSON"),
            Some(VendorPayloadKind::CloudApiJson)
        );
        assert_eq!(VendorPayloadKind::from_content_type("text/plain"), None);
    }

    #[test]
    fn form_payload_strips_vendor_prefix() {
        let body = b"From=whatsapp%3A%2B77011234567&To=whatsapp%3A%2B77000000000&Body=+175+%D1%81%D0%BC+80+%D0%BA%D0%B3+";
        let msg = decode(VendorPayloadKind::TwilioForm, body, received()).unwrap();
        assert_eq!(msg.from.as_str(), "+77011234567");
        assert_eq!(msg.to, "+77000000000");
        assert_eq!(msg.text, "175 см 80 кг");
        assert_eq!(msg.timestamp, received());
    }

    #[test]
    fn form_without_sender_is_unrecognized() {
        let err = decode(VendorPayloadKind::TwilioForm, b"foo=bar", received()).unwrap_err();
        assert_eq!(err, DecodeError::UnrecognizedShape(VendorPayloadKind::TwilioForm));
    }

    #[test]
    fn cloud_text_message() {
        let body = json!({
            "entry": [{"changes": [{"value": {
                "metadata": {"display_phone_number": "77000000000"},
                "messages": [{"from": "77011234567", "type": "text",
                              "text": {"body": "Да"}, "timestamp": "1714564800"}]
            }}]}]
        });
        let msg = decode(
            VendorPayloadKind::CloudApiJson,
            body.to_string().as_bytes(),
            received(),
        )
        .unwrap();
        assert_eq!(msg.from.as_str(), "+77011234567");
        assert_eq!(msg.to, "77000000000");
        assert_eq!(msg.text, "Да");
        assert_eq!(msg.timestamp, Utc.timestamp_opt(1_714_564_800, 0).unwrap());
        assert_eq!(msg.dedup_key(), "2024-05-01T12:00:00Z:+77011234567");
    }

    #[test]
    fn cloud_button_reply_uses_button_text() {
        let body = json!({
            "entry": [{"changes": [{"value": {
                "messages": [{"from": "77011234567", "type": "button",
                              "button": {"text": "Нет"}}]
            }}]}]
        });
        let msg = decode(
            VendorPayloadKind::CloudApiJson,
            body.to_string().as_bytes(),
            received(),
        )
        .unwrap();
        assert_eq!(msg.text, "Нет");
        assert_eq!(msg.to, "");
        assert_eq!(msg.timestamp, received());
    }

    #[test]
    fn cloud_status_callback_has_no_message() {
        let body = json!({"entry": [{"changes": [{"value": {"statuses": [{"id": "x"}]}}]}]});
        let err = decode(
            VendorPayloadKind::CloudApiJson,
            body.to_string().as_bytes(),
            received(),
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::NoMessage);
    }

    #[test]
    fn json_of_the_wrong_shape_is_rejected() {
        let err = decode(VendorPayloadKind::CloudApiJson, br#"{"hello": 1}"#, received()).unwrap_err();
        assert_eq!(err, DecodeError::UnrecognizedShape(VendorPayloadKind::CloudApiJson));

        let err = decode(VendorPayloadKind::CloudApiJson, b"not json", received()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }
}
