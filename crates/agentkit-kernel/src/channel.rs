//! Point-to-point publish/subscribe transport.
//!
//! A [`Channel`] delivers a [`Message`] to every callback subscribed under a
//! recipient id.  The in-process implementation, [`InProcessChannel`], fans
//! each publish out into a bounded delivery queue that is drained by a fixed
//! pool of worker tasks.
//!
//! # Delivery contract
//!
//! - **At-most-once.**  Each callback is invoked at most once per publish;
//!   failed deliveries are never retried.
//! - **Unordered.**  Callbacks of one publish run on independent workers and
//!   may complete in any order.
//! - **Isolated.**  A callback error (or panic) is logged and counted, never
//!   reported back to the publisher.
//! - **No expiry enforcement.**  Expired messages are delivered; consumers
//!   check [`Message::is_expired`].
//!
//! Publishing to a recipient without subscribers drops the message.
//! Publishing from inside a callback never waits for queue capacity: the
//! workers are the only consumers, so a full queue drops the delivery.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::message::Message;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Callback invoked for every message delivered to a subscribed id.
///
/// The callback owns its copy of the message.  An `Err` is logged by the
/// channel and otherwise ignored.
pub type Subscriber =
    Arc<dyn Fn(Message) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Wrap an async closure as a [`Subscriber`].
pub fn subscriber<F, Fut>(f: F) -> Subscriber
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Transport abstraction used by agents and the topic router.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Deliver `message` to every callback subscribed as `recipient`.
    ///
    /// Returns the message id.  Success means the message was accepted for
    /// delivery, not that any callback ran.
    async fn publish(&self, recipient: &str, message: Message) -> Result<Uuid>;

    /// Register an additional callback for `agent_id`.
    async fn subscribe(&self, agent_id: &str, callback: Subscriber) -> Result<()>;

    /// Drop every callback registered for `agent_id`.
    async fn unsubscribe(&self, agent_id: &str) -> Result<()>;

    /// Stop accepting messages and release subscriptions.
    async fn close(&self) -> Result<()>;
}

/// Tuning for [`InProcessChannel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of the delivery queue.  Publishers wait when it is full.
    pub queue_capacity: usize,

    /// Number of worker tasks draining the queue.
    pub workers: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------------------

tokio::task_local! {
    /// Set while a worker runs a callback.
    static ON_WORKER: ();
}

/// One pending callback invocation.
struct Delivery {
    recipient: String,
    message: Message,
    callback: Subscriber,
}

/// In-process [`Channel`] backed by a bounded queue and a worker pool.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct InProcessChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    /// Recipient id -> callbacks.
    subscribers: DashMap<String, Vec<Subscriber>>,

    /// Producer side of the delivery queue.  `None` once closed.
    queue: RwLock<Option<mpsc::Sender<Delivery>>>,

    closed: AtomicBool,
    stats: Arc<DeliveryStats>,
}

/// Delivery counters shared with the workers.
#[derive(Debug, Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl InProcessChannel {
    /// Create a channel and spawn its worker pool on the current runtime.
    ///
    /// Fails when called outside a tokio runtime.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|e| KernelError::ChannelInit {
                reason: e.to_string(),
            })?;

        let capacity = config.queue_capacity.max(1);
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel::<Delivery>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(DeliveryStats::default());

        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let stats = Arc::clone(&stats);
            handle.spawn(async move {
                tracing::trace!(worker_id, "channel worker started");
                Self::worker_loop(rx, stats).await;
                tracing::trace!(worker_id, "channel worker stopped");
            });
        }

        tracing::debug!(capacity, workers, "in-process channel created");

        Ok(Self {
            inner: Arc::new(ChannelInner {
                subscribers: DashMap::new(),
                queue: RwLock::new(Some(tx)),
                closed: AtomicBool::new(false),
                stats,
            }),
        })
    }

    /// Number of callbacks registered for `agent_id`.
    pub fn subscriber_count(&self, agent_id: &str) -> usize {
        self.inner
            .subscribers
            .get(agent_id)
            .map(|callbacks| callbacks.len())
            .unwrap_or(0)
    }

    /// Ids that currently have at least one callback.
    pub fn subscribed_ids(&self) -> Vec<String> {
        self.inner
            .subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Callback invocations that returned `Ok`.
    pub fn delivered_count(&self) -> u64 {
        self.inner.stats.delivered.load(Ordering::Relaxed)
    }

    /// Callback invocations that returned `Err` or panicked.
    pub fn failed_count(&self) -> u64 {
        self.inner.stats.failed.load(Ordering::Relaxed)
    }

    /// Deliveries dropped because a callback published into a full queue.
    pub fn dropped_count(&self) -> u64 {
        self.inner.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn sender(&self) -> Result<mpsc::Sender<Delivery>> {
        self.inner
            .queue
            .read()
            .map_err(|e| KernelError::Internal(format!("queue lock poisoned: {e}")))?
            .clone()
            .ok_or(KernelError::ChannelClosed)
    }

    async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Delivery>>>, stats: Arc<DeliveryStats>) {
        loop {
            let next = { rx.lock().await.recv().await };
            let Some(delivery) = next else {
                break;
            };

            let Delivery {
                recipient,
                message,
                callback,
            } = delivery;
            let message_id = message.message_id;

            let call = AssertUnwindSafe(callback(message)).catch_unwind();
            match ON_WORKER.scope((), call).await {
                Ok(Ok(())) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(recipient = %recipient, %message_id, "message delivered");
                }
                Ok(Err(e)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        recipient = %recipient,
                        %message_id,
                        error = %e,
                        "subscriber callback failed"
                    );
                }
                Err(_) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(recipient = %recipient, %message_id, "subscriber callback panicked");
                }
            }
        }
    }
}

#[async_trait]
impl Channel for InProcessChannel {
    async fn publish(&self, recipient: &str, message: Message) -> Result<Uuid> {
        if self.is_closed() {
            return Err(KernelError::ChannelClosed);
        }

        let message_id = message.message_id;
        let callbacks = self
            .inner
            .subscribers
            .get(recipient)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        if callbacks.is_empty() {
            tracing::debug!(
                recipient = %recipient,
                %message_id,
                intent = %message.intent,
                "no subscribers; message dropped"
            );
            return Ok(message_id);
        }

        let tx = self.sender()?;
        let on_worker = ON_WORKER.try_with(|_| ()).is_ok();
        for callback in callbacks {
            let delivery = Delivery {
                recipient: recipient.to_owned(),
                message: message.clone(),
                callback,
            };
            if !on_worker {
                tx.send(delivery)
                    .await
                    .map_err(|e| KernelError::PublishFailed {
                        recipient: recipient.to_owned(),
                        reason: e.to_string(),
                    })?;
                continue;
            }
            match tx.try_send(delivery) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        recipient = %recipient,
                        %message_id,
                        intent = %message.intent,
                        "delivery queue full; message published from a callback was dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => return Err(KernelError::ChannelClosed),
            }
        }

        tracing::debug!(recipient = %recipient, %message_id, intent = %message.intent, "message published");
        Ok(message_id)
    }

    async fn subscribe(&self, agent_id: &str, callback: Subscriber) -> Result<()> {
        if self.is_closed() {
            return Err(KernelError::ChannelClosed);
        }
        self.inner
            .subscribers
            .entry(agent_id.to_owned())
            .or_default()
            .push(callback);
        tracing::debug!(agent_id = %agent_id, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, agent_id: &str) -> Result<()> {
        if self.inner.subscribers.remove(agent_id).is_some() {
            tracing::debug!(agent_id = %agent_id, "unsubscribed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the sender lets workers drain what is queued, then exit.
        let sender = self
            .inner
            .queue
            .write()
            .map_err(|e| KernelError::Internal(format!("queue lock poisoned: {e}")))?
            .take();
        drop(sender);
        self.inner.subscribers.clear();

        tracing::info!("channel closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{Value, json};

    fn forwarder(tx: mpsc::UnboundedSender<Message>) -> Subscriber {
        subscriber(move |message| {
            let tx = tx.clone();
            async move { tx.send(message).map_err(|e| e.to_string()) }
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let channel = InProcessChannel::new(ChannelConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe("bob", forwarder(tx)).await.unwrap();

        let msg = Message::new("alice", "greet", json!({"hi": true}));
        let id = channel.publish("bob", msg.clone()).await.unwrap();
        assert_eq!(id, msg.message_id);

        let got = recv(&mut rx).await.expect("delivery");
        assert_eq!(got.message_id, msg.message_id);
    }

    #[tokio::test]
    async fn every_callback_gets_one_copy() {
        let channel = InProcessChannel::new(ChannelConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe("bob", forwarder(tx.clone())).await.unwrap();
        channel.subscribe("bob", forwarder(tx)).await.unwrap();
        assert_eq!(channel.subscriber_count("bob"), 2);

        channel
            .publish("bob", Message::new("alice", "x", Value::Null))
            .await
            .unwrap();

        assert!(recv(&mut rx).await.is_some());
        assert!(recv(&mut rx).await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "no duplicate delivery"
        );
    }

    #[tokio::test]
    async fn callback_error_is_not_propagated() {
        let channel = InProcessChannel::new(ChannelConfig::default()).unwrap();
        channel
            .subscribe(
                "bob",
                subscriber(|_msg| async { Err("boom".to_string()) }),
            )
            .await
            .unwrap();

        let result = channel
            .publish("bob", Message::new("alice", "x", Value::Null))
            .await;
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.failed_count(), 1);
    }

    #[tokio::test]
    async fn no_subscribers_drops_silently() {
        let channel = InProcessChannel::new(ChannelConfig::default()).unwrap();
        let result = channel
            .publish("nobody", Message::new("alice", "x", Value::Null))
            .await;
        assert!(result.is_ok());
        assert_eq!(channel.delivered_count(), 0);
    }

    #[tokio::test]
    async fn expired_messages_are_still_delivered() {
        let channel = InProcessChannel::new(ChannelConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe("bob", forwarder(tx)).await.unwrap();

        let mut msg = Message::new("alice", "x", Value::Null).with_ttl(1);
        msg.timestamp = chrono::Utc::now() - chrono::Duration::seconds(60);
        assert!(msg.is_expired());

        channel.publish("bob", msg).await.unwrap();
        let got = recv(&mut rx).await.expect("delivered despite expiry");
        assert!(got.is_expired());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let channel = InProcessChannel::new(ChannelConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe("bob", forwarder(tx)).await.unwrap();
        channel.unsubscribe("bob").await.unwrap();

        channel
            .publish("bob", Message::new("alice", "x", Value::Null))
            .await
            .unwrap();
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let channel = InProcessChannel::new(ChannelConfig::default()).unwrap();
        channel.close().await.unwrap();
        assert!(channel.is_closed());

        let result = channel
            .publish("bob", Message::new("alice", "x", Value::Null))
            .await;
        assert!(matches!(result, Err(KernelError::ChannelClosed)));

        // Closing twice is harmless.
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn replies_from_callbacks_never_stall_the_queue() {
        let channel = InProcessChannel::new(ChannelConfig {
            queue_capacity: 1,
            workers: 1,
        })
        .unwrap();
        let (tx, mut pongs) = mpsc::unbounded_channel();
        channel.subscribe("client", forwarder(tx)).await.unwrap();

        let replier = channel.clone();
        channel
            .subscribe(
                "srv",
                subscriber(move |ping: Message| {
                    let replier = replier.clone();
                    async move {
                        let pong = Message::new("srv", "pong", Value::Null)
                            .with_reply_to(ping.message_id);
                        replier
                            .publish("client", pong)
                            .await
                            .map(|_| ())
                            .map_err(|e| e.to_string())
                    }
                }),
            )
            .await
            .unwrap();

        let burst = async {
            for _ in 0..20 {
                channel
                    .publish("srv", Message::new("client", "ping", Value::Null))
                    .await
                    .unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(2), burst)
            .await
            .expect("publishers must not block forever");

        // Every ping is answered or its pong is counted as dropped.
        let drained = async {
            let mut received = 0;
            while received + channel.dropped_count() < 20 {
                match tokio::time::timeout(Duration::from_millis(20), pongs.recv()).await {
                    Ok(Some(_)) => received += 1,
                    Ok(None) => panic!("client inbox closed"),
                    Err(_) => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), drained)
            .await
            .expect("every ping answered or dropped");

        // The channel still works once the burst has drained.
        let last = channel
            .publish("srv", Message::new("client", "ping", Value::Null))
            .await
            .unwrap();
        loop {
            let pong = recv(&mut pongs).await.expect("pong after burst");
            if pong.reply_to == Some(last) {
                break;
            }
        }
    }

    #[test]
    fn construction_outside_runtime_fails() {
        let result = InProcessChannel::new(ChannelConfig::default());
        assert!(matches!(result, Err(KernelError::ChannelInit { .. })));
    }
}
