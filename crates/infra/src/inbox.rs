//! Inbound ingest: normalized message -> parsed reply -> inbox row.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use sizeflow_messaging::{parse, InboundMessage, ParsedReply};

use crate::store::{EventRecord, InboxRecord, InboxRepo, Store, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub parsed: ParsedReply,
    /// The same message was already stored; nothing was written.
    pub duplicate: bool,
}

/// Parse and store one inbound message together with its audit event.
///
/// The order is resolved later by phone, so the row carries no order id.
pub async fn ingest(
    store: &dyn Store,
    message: &InboundMessage,
    received_at: DateTime<Utc>,
) -> StoreResult<Ingested> {
    let parsed = parse(&message.text);
    let record = InboxRecord {
        id: message.dedup_key(),
        order_id: None,
        from_phone: message.from.clone(),
        text: message.text.clone(),
        parsed,
        sent_at: message.timestamp,
        created_at: received_at,
    };
    let event = EventRecord::new(
        None,
        "wa_inbound",
        json!({ "normalized": message, "parsed": parsed }),
        received_at,
    );

    let stored = store.record_inbound(&record, &event).await?;
    if stored {
        info!(from = %message.from, has_measurements = parsed.measurements().is_some(), confirmation = ?parsed.confirmation, "inbound message stored");
    } else {
        debug!(id = %record.id, "inbound message already stored");
    }
    Ok(Ingested {
        parsed,
        duplicate: !stored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sizeflow_core::PhoneNumber;
    use sizeflow_messaging::Confirmation;

    use crate::store::InMemoryStore;

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            from: PhoneNumber::parse("87011234567").unwrap(),
            to: "+77000000000".into(),
            text: text.into(),
            timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn stores_parsed_reply_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let first = ingest(&store, &message("175 см, 80 кг, да"), now).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.parsed.measurements(), Some((175, 80)));
        assert_eq!(first.parsed.confirmation, Some(Confirmation::Yes));

        let again = ingest(&store, &message("175 см, 80 кг, да"), now).await.unwrap();
        assert!(again.duplicate);

        let phone = PhoneNumber::parse("+77011234567").unwrap();
        let rows = store.inbound_since(&phone, now).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "2024-05-01T12:00:00Z:+77011234567");
    }

    #[tokio::test]
    async fn text_without_fields_is_still_stored() {
        let store = InMemoryStore::new();
        let ingested = ingest(&store, &message("Здравствуйте"), Utc::now()).await.unwrap();
        assert!(ingested.parsed.is_empty());
        assert!(!ingested.duplicate);
    }
}
