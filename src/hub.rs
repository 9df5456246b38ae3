// The public façade. Generalizes the teacher's `AppState`/`Broker` pairing
// (a shared session map plus a writer the whole process funnels through)
// into the session-scoped subscribe/unsubscribe/broadcast/backlog contract.
use crate::config::PubsubConfig;
use crate::error::PubsubError;
use crate::message::Message;
use crate::store::Store;
use crate::subscriber::{Callback, Subscriber};
use crate::writer::Writer;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;

struct SessionEntry {
    subscriber: Subscriber,
    callbacks: Arc<RwLock<Vec<Callback>>>,
}

pub struct Hub {
    store: Arc<Store>,
    writer: Arc<Writer>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    config: PubsubConfig,
    shut_down: AtomicBool,
}

impl Hub {
    pub fn new(store: Arc<Store>, writer: Arc<Writer>, config: PubsubConfig) -> Self {
        Self {
            store,
            writer,
            sessions: RwLock::new(HashMap::new()),
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    fn check_not_shut_down(&self) -> Result<(), PubsubError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(PubsubError::UsedAfterShutdown)
        } else {
            Ok(())
        }
    }

    /// Registers `cb` under `session_id`. Starts a Subscriber for the session
    /// on first registration; the whole get-or-create happens under one
    /// write lock, so a concurrent second `subscribe` for the same session
    /// can never start a second Subscriber.
    pub async fn subscribe(
        &self,
        session_id: impl Into<String>,
        cb: Callback,
    ) -> Result<(), PubsubError> {
        self.check_not_shut_down()?;

        let session_id = session_id.into();
        let mut sessions = self.sessions.write().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PubsubError::UsedAfterShutdown);
        }

        if !sessions.contains_key(&session_id) {
            let callbacks = Arc::new(RwLock::new(Vec::new()));
            let subscriber = Subscriber::new(
                session_id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&callbacks),
                &self.config,
            );
            subscriber.start().await;
            sessions.insert(session_id.clone(), SessionEntry { subscriber, callbacks });
        }

        let entry = sessions.get(&session_id).expect("just inserted or already present");
        entry.callbacks.write().await.push(cb);
        Ok(())
    }

    /// Removes all callbacks for the session and stops its Subscriber.
    pub async fn unsubscribe(&self, session_id: &str) -> Result<(), PubsubError> {
        self.check_not_shut_down()?;

        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        if let Some(entry) = entry {
            entry.subscriber.stop().await;
        }
        Ok(())
    }

    /// Delegates to `Writer::enqueue`. Returns immediately; the publisher
    /// does not observe delivery.
    pub fn broadcast(
        &self,
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        data: Option<String>,
    ) -> Result<bool, PubsubError> {
        self.check_not_shut_down()?;
        Ok(self.writer.enqueue(session_id, event_type, data))
    }

    /// Convenience for structured payloads: JSON-encodes `payload` before
    /// handing it to the Writer as a string.
    pub fn broadcast_json<T: Serialize>(
        &self,
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<bool, PubsubError> {
        self.check_not_shut_down()?;
        let data = serde_json::to_string(payload)?;
        Ok(self.writer.enqueue(session_id, event_type, Some(data)))
    }

    /// The SSE reconnection query: undelivered rows after `after_id`. Does
    /// not mark them delivered — the caller is a one-shot HTTP replay, not a
    /// durable subscriber.
    pub async fn backlog(
        &self,
        session_id: &str,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, PubsubError> {
        self.check_not_shut_down()?;
        self.store.fetch_undelivered(session_id, after_id, limit).await
    }

    /// Stops every Subscriber, then shuts down the Writer. Idempotent: a
    /// second call is a no-op. Every other method returns
    /// `PubsubError::UsedAfterShutdown` once this completes.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries: Vec<SessionEntry> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.subscriber.stop().await;
        }
        if let Err(e) = self.writer.shutdown().await {
            error!(error = %e, "writer did not shut down cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;
    use std::sync::Mutex as StdMutex;

    async fn hub() -> (Hub, Arc<Store>) {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let config = PubsubConfig {
            polling_interval_ms: 5,
            ..Default::default()
        };
        let writer = Arc::new(Writer::new(Arc::clone(&store), &config).await);
        (Hub::new(Arc::clone(&store), writer, config), store)
    }

    #[tokio::test]
    async fn concurrent_producers_all_get_delivered_grouped_by_thread() {
        let (hub, _store) = hub().await;
        let hub = Arc::new(hub);

        let received: Arc<StdMutex<Vec<(u32, u32)>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        hub.subscribe(
            "s",
            Arc::new(move |event: &crate::message::DeliveredEvent| {
                let parsed: serde_json::Value = serde_json::from_str(&event.data).unwrap();
                let thread = parsed["thread"].as_u64().unwrap() as u32;
                let msg = parsed["msg"].as_u64().unwrap() as u32;
                received_clone.lock().unwrap().push((thread, msg));
            }),
        )
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for t in 0..5u32 {
            let hub = Arc::clone(&hub);
            tasks.push(tokio::spawn(async move {
                for m in 0..5u32 {
                    hub.broadcast_json(
                        "s",
                        "e",
                        &serde_json::json!({"thread": t, "msg": m}),
                    )
                    .unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let all = received.lock().unwrap().clone();
        assert_eq!(all.len(), 25);
        for t in 0..5u32 {
            let count = all.iter().filter(|(thread, _)| *thread == t).count();
            assert_eq!(count, 5, "thread {t} should contribute exactly 5 messages");
        }

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn isolation_between_sessions() {
        let (hub, _store) = hub().await;

        let s1: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let s1_clone = Arc::clone(&s1);
        hub.subscribe(
            "s1",
            Arc::new(move |event: &crate::message::DeliveredEvent| {
                s1_clone.lock().unwrap().push(event.data.clone());
            }),
        )
        .await
        .unwrap();

        let s2: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let s2_clone = Arc::clone(&s2);
        hub.subscribe(
            "s2",
            Arc::new(move |event: &crate::message::DeliveredEvent| {
                s2_clone.lock().unwrap().push(event.data.clone());
            }),
        )
        .await
        .unwrap();

        hub.broadcast("s1", "e", Some("hi1".into())).unwrap();
        hub.broadcast("s2", "e", Some("hi2".into())).unwrap();
        hub.broadcast("s1", "e", Some("hi1b".into())).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(*s1.lock().unwrap(), vec!["hi1".to_string(), "hi1b".to_string()]);
        assert_eq!(*s2.lock().unwrap(), vec!["hi2".to_string()]);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn backlog_returns_only_rows_after_cursor() {
        let (hub, store) = hub().await;

        store
            .insert_batch(&[
                NewMessage {
                    session_id: "s".into(),
                    event_type: "e".into(),
                    data: Some("m1".into()),
                    created_at: 1.0,
                },
                NewMessage {
                    session_id: "s".into(),
                    event_type: "e".into(),
                    data: Some("m2".into()),
                    created_at: 2.0,
                },
                NewMessage {
                    session_id: "s".into(),
                    event_type: "e".into(),
                    data: Some("m3".into()),
                    created_at: 3.0,
                },
            ])
            .await
            .unwrap();

        let all = hub.backlog("s", 0, 100).await.unwrap();
        assert_eq!(all.len(), 3);
        let (m1, m2, m3) = (all[0].id, all[1].id, all[2].id);

        store.mark_delivered(&[m1, m2], 10.0).await.unwrap();

        let backlog = hub.backlog("s", m2, 100).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, m3);
        assert_eq!(backlog[0].data, "m3");

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn every_operation_fails_after_shutdown() {
        let (hub, _store) = hub().await;
        hub.shutdown().await;

        assert!(matches!(
            hub.subscribe("s", Arc::new(|_: &crate::message::DeliveredEvent| {}))
                .await,
            Err(PubsubError::UsedAfterShutdown)
        ));
        assert!(matches!(
            hub.unsubscribe("s").await,
            Err(PubsubError::UsedAfterShutdown)
        ));
        assert!(matches!(
            hub.broadcast("s", "e", None),
            Err(PubsubError::UsedAfterShutdown)
        ));
        assert!(matches!(
            hub.broadcast_json("s", "e", &serde_json::json!({})),
            Err(PubsubError::UsedAfterShutdown)
        ));
        assert!(matches!(
            hub.backlog("s", 0, 10).await,
            Err(PubsubError::UsedAfterShutdown)
        ));

        // idempotent: a second shutdown must not panic or hang
        hub.shutdown().await;
    }
}
