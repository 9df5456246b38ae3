// Error taxonomy for the delivery engine. Internal failures (store errors, a
// full intake queue, a missed shutdown deadline) are recovered and logged by
// the component that hit them; they only reach a caller as a `PubsubError`
// when the façade has no other way to report them (encoding a JSON payload,
// or a programmer mistake like using the Hub after it has been shut down).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubsubError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("failed to encode payload as JSON: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("intake queue full for session {session_id}")]
    IntakeFull { session_id: String },

    #[error("writer did not drain within {timeout:?}, {pending} messages pending")]
    ShutdownTimeout {
        timeout: std::time::Duration,
        pending: usize,
    },

    #[error("operation attempted after hub shutdown")]
    UsedAfterShutdown,
}
