// Drives the delivery loop for a single session. Cursor and callback list
// are the Subscriber's own; callbacks are dispatched full-row-before-cursor-
// advance so a crash between delivery and the delivered-mark can only ever
// cause a re-delivery, never a skip. Concurrency idiom (`Arc<RwLock<Vec<_>>>`
// registrations, a background `tokio::spawn`ed loop) mirrors the teacher's
// `broker.rs::subscriptions` / `websocket.rs` topic-task pattern.
use crate::config::PubsubConfig;
use crate::message::{DeliveredEvent, Message};
use crate::store::Store;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// A registered listener: invoked with each row in ascending `id` order.
pub type Callback = Arc<dyn Fn(&DeliveredEvent) + Send + Sync>;

struct Inner {
    session_id: String,
    store: Arc<Store>,
    callbacks: Arc<RwLock<Vec<Callback>>>,
    cursor: AtomicI64,
    running: AtomicBool,
    notify: Notify,
    polling_interval: Duration,
    max_consecutive_failures: Option<u32>,
}

pub struct Subscriber {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(
        session_id: String,
        store: Arc<Store>,
        callbacks: Arc<RwLock<Vec<Callback>>>,
        config: &PubsubConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id,
                store,
                callbacks,
                cursor: AtomicI64::new(0),
                running: AtomicBool::new(false),
                notify: Notify::new(),
                polling_interval: config.polling_interval(),
                max_consecutive_failures: config.max_consecutive_failures,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Idempotent: launches the poll loop if it isn't already running.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(Self::poll_loop(inner));
        *self.handle.lock().await = Some(handle);
    }

    /// Idempotent: signals the loop to exit and waits (bounded) for it.
    /// Cooperative — an in-flight store call is allowed to complete.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    async fn poll_loop(inner: Arc<Inner>) {
        let mut consecutive_failures = 0u32;

        while inner.running.load(Ordering::Acquire) {
            let cursor = inner.cursor.load(Ordering::Acquire);
            match inner.store.fetch_undelivered(&inner.session_id, cursor, 100).await {
                Ok(rows) if rows.is_empty() => {
                    consecutive_failures = 0;
                    tokio::select! {
                        _ = tokio::time::sleep(inner.polling_interval) => {}
                        _ = inner.notify.notified() => {}
                    }
                }
                Ok(rows) => {
                    consecutive_failures = 0;
                    Self::deliver(&inner, rows).await;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(session_id = %inner.session_id, error = %e, "subscriber poll failed");
                    if let Some(budget) = inner.max_consecutive_failures {
                        if consecutive_failures >= budget {
                            error!(
                                session_id = %inner.session_id,
                                "subscriber stopping after repeated store failures"
                            );
                            break;
                        }
                    }
                    tokio::time::sleep(inner.polling_interval).await;
                }
            }
        }

        inner.running.store(false, Ordering::Release);
    }

    /// Dispatches every row to every registered callback (row-major, so a row
    /// is fully delivered to all callbacks before the cursor advances past
    /// it), then marks the whole batch delivered in one call.
    async fn deliver(inner: &Arc<Inner>, rows: Vec<Message>) {
        let callbacks = inner.callbacks.read().await.clone();
        let mut ids = Vec::with_capacity(rows.len());

        for row in &rows {
            let event = DeliveredEvent::from(row);
            for cb in &callbacks {
                if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                    error!(
                        session_id = %inner.session_id,
                        id = row.id,
                        "subscriber callback panicked, continuing with remaining callbacks"
                    );
                }
            }
            inner.cursor.store(row.id, Ordering::Release);
            ids.push(row.id);
        }

        if let Err(e) = inner.store.mark_delivered(&ids, now_f64()).await {
            error!(session_id = %inner.session_id, error = %e, "failed to mark rows delivered");
        }
    }
}

fn now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}
