//! Local watch fan-out broker.
//!
//! One dispatcher task owns the subscriber table and reads from a single
//! inbound event queue. Subscribe and unsubscribe are messages to that task;
//! nothing else touches the table.
//!
//! Each subscriber gets a private bounded queue. The dispatcher never waits
//! on it: when a queue is full the subscriber is evicted, its stream ends,
//! and the watcher is expected to reconnect and replay from the last
//! revision it saw.

use crate::core::error::{KvsqlError, KvsqlResult};
use crate::kv::KeyValue;
use crate::watch::notifier::Notifier;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default capacity of the inbound event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
/// Capacity of each subscriber's delivery queue.
pub const SUBSCRIBER_CAPACITY: usize = 100;

type SubscriberId = u64;

enum Command {
    Subscribe {
        id: SubscriberId,
        tx: mpsc::Sender<KeyValue>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
}

/// Watch event broker.
pub struct Broadcaster {
    events: mpsc::Sender<KeyValue>,
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    subscribers: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Broadcaster {
    /// Create a broker and spawn its dispatcher on the current runtime.
    pub fn new(capacity: usize) -> Self {
        let (events, events_rx) = mpsc::channel(capacity.max(1));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        tokio::spawn(dispatch(
            events_rx,
            commands_rx,
            subscribers.clone(),
            shutdown.clone(),
        ));

        Self {
            events,
            commands,
            next_id: AtomicU64::new(1),
            subscribers,
            shutdown,
        }
    }

    /// Queue an event for every current subscriber.
    pub async fn publish(&self, kv: KeyValue) -> KvsqlResult<()> {
        self.events
            .send(kv)
            .await
            .map_err(|_| KvsqlError::notification("broadcaster is closed"))
    }

    /// Register a subscriber bound to `cancel`.
    ///
    /// The subscription is retired when `cancel` fires or the returned
    /// handle is dropped. Events published after this call returns are
    /// delivered to it.
    pub fn subscribe(&self, cancel: CancellationToken) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let token = cancel.child_token();

        if self.commands.send(Command::Subscribe { id, tx }).is_err() {
            tracing::debug!(id, "subscribe on closed broadcaster");
        }

        let commands = self.commands.clone();
        let retire = token.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = retire.cancelled() => {
                    let _ = commands.send(Command::Unsubscribe { id });
                }
                _ = shutdown.cancelled() => {}
            }
        });

        Subscription { id, rx, token }
    }

    /// Number of registered subscribers as seen by the dispatcher.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Stop the dispatcher; every subscription stream ends.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Notifier for Broadcaster {
    async fn notify(&self, kv: &KeyValue) -> KvsqlResult<()> {
        self.publish(kv.clone()).await
    }
}

async fn dispatch(
    mut events: mpsc::Receiver<KeyValue>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    count: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let mut subscribers: HashMap<SubscriberId, mpsc::Sender<KeyValue>> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(command) = commands.recv() => match command {
                Command::Subscribe { id, tx } => {
                    subscribers.insert(id, tx);
                }
                Command::Unsubscribe { id } => {
                    subscribers.remove(&id);
                }
            },
            event = events.recv() => {
                let Some(kv) = event else { break };
                subscribers.retain(|id, tx| match tx.try_send(kv.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(subscriber = id, revision = kv.revision, "watch subscriber lagging, evicted");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
        count.store(subscribers.len(), Ordering::Release);
    }

    count.store(0, Ordering::Release);
    tracing::debug!("watch dispatcher stopped");
}

/// A live watch subscription.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<KeyValue>,
    token: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once cancelled, evicted or shut down.
    pub async fn recv(&mut self) -> Option<KeyValue> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            kv = self.rx.recv() => kv,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn kv(key: &str, revision: i64) -> KeyValue {
        KeyValue {
            id: revision,
            key: key.to_string(),
            value: b"v".to_vec(),
            old_value: Vec::new(),
            old_revision: 0,
            create_revision: revision,
            revision,
            ttl: 0,
            version: 1,
            del: false,
        }
    }

    async fn wait_for_count(b: &Broadcaster, expected: usize) {
        for _ in 0..200 {
            if b.subscriber_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "subscriber count stuck at {}, expected {}",
            b.subscriber_count(),
            expected
        );
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let b = Broadcaster::new(DEFAULT_EVENT_CAPACITY);
        let mut s1 = b.subscribe(CancellationToken::new());
        let mut s2 = b.subscribe(CancellationToken::new());

        b.publish(kv("/a", 2)).await.unwrap();
        b.publish(kv("/b", 3)).await.unwrap();

        for s in [&mut s1, &mut s2] {
            assert_eq!(s.recv().await.unwrap().revision, 2);
            assert_eq!(s.recv().await.unwrap().revision, 3);
        }
        assert_ne!(s1.id(), s2.id());
    }

    #[tokio::test]
    async fn test_cancel_retires_subscription() {
        let b = Broadcaster::new(DEFAULT_EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let mut s = b.subscribe(cancel.clone());
        wait_for_count(&b, 1).await;

        cancel.cancel();
        assert!(s.recv().await.is_none());
        wait_for_count(&b, 0).await;
    }

    #[tokio::test]
    async fn test_drop_retires_subscription() {
        let b = Broadcaster::new(DEFAULT_EVENT_CAPACITY);
        let s = b.subscribe(CancellationToken::new());
        wait_for_count(&b, 1).await;
        drop(s);
        wait_for_count(&b, 0).await;
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let b = Broadcaster::new(DEFAULT_EVENT_CAPACITY);
        let mut slow = b.subscribe(CancellationToken::new());
        let mut fast = b.subscribe(CancellationToken::new());

        let total = SUBSCRIBER_CAPACITY as i64 + 10;
        for rev in 0..total {
            b.publish(kv("/a", rev + 2)).await.unwrap();
            assert_eq!(fast.recv().await.unwrap().revision, rev + 2);
        }

        let mut received = 0;
        while slow.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_CAPACITY);
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let b = Broadcaster::new(DEFAULT_EVENT_CAPACITY);
        let mut s = b.subscribe(CancellationToken::new());
        b.shutdown();
        assert!(s.recv().await.is_none());
        assert!(b.is_closed());
    }
}
