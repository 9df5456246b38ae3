// The only persisted entity, plus the event shape handed to subscriber
// callbacks. `data` is opaque to the engine: it is never parsed, only
// carried through.
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    pub data: String,
    pub created_at: f64,
    pub delivered_at: Option<f64>,
}

/// A batch-insert candidate, not yet assigned an `id` by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub event_type: String,
    pub data: Option<String>,
    pub created_at: f64,
}

/// What a subscriber callback actually receives: `{id, event_type, data}`,
/// per the external event record shape. `data` is passed through verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveredEvent {
    pub id: i64,
    pub event_type: String,
    pub data: String,
}

impl From<&Message> for DeliveredEvent {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            event_type: message.event_type.clone(),
            data: message.data.clone(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    pub data: Option<String>,
    pub created_at: f64,
    pub delivered_at: Option<f64>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            event_type: row.event_type,
            data: row.data.unwrap_or_default(),
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        }
    }
}
