//! Publish/subscribe transport used by the control channel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use super::BusError;

/// Boxed future returned by [`MessageBus`] methods.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// A message delivered on a subject.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// Stream of messages for one subject.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Wraps a receiver fed by a bus.
    #[must_use]
    pub const fn new(subject: String, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { subject, receiver }
    }

    /// Subject this subscription listens on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Waits for the next message; `None` once the bus closes.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Waits up to `wait` for the next message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Timeout`] when nothing arrives in time and
    /// [`BusError::Closed`] when the bus went away.
    pub async fn next_timeout(&mut self, wait: Duration) -> Result<Message, BusError> {
        match tokio::time::timeout(wait, self.receiver.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                subject: self.subject.clone(),
                waited_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

/// Minimal publish/subscribe interface.
pub trait MessageBus: Send + Sync {
    /// Starts receiving messages published on `subject`.
    fn subscribe<'a>(&'a self, subject: &'a str) -> BusFuture<'a, Subscription>;

    /// Publishes `payload` on `subject`.
    fn publish<'a>(&'a self, subject: &'a str, payload: Vec<u8>) -> BusFuture<'a, ()>;
}

pub(crate) type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>>;

/// Fans a message out to every live sender registered for its subject,
/// pruning senders whose receiver has gone.
pub(crate) async fn dispatch(subscribers: &Subscribers, message: Message) -> usize {
    let mut table = subscribers.lock().await;
    let Some(senders) = table.get_mut(&message.subject) else {
        return 0;
    };
    senders.retain(|sender| sender.send(message.clone()).is_ok());
    let delivered = senders.len();
    if senders.is_empty() {
        table.remove(&message.subject);
    }
    delivered
}

pub(crate) async fn register(subscribers: &Subscribers, subject: &str) -> Subscription {
    let (sender, receiver) = mpsc::unbounded_channel();
    subscribers
        .lock()
        .await
        .entry(subject.to_owned())
        .or_default()
        .push(sender);
    Subscription::new(subject.to_owned(), receiver)
}

/// In-process bus.
#[derive(Clone, Debug, Default)]
pub struct MemoryBus {
    subscribers: Subscribers,
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBus for MemoryBus {
    fn subscribe<'a>(&'a self, subject: &'a str) -> BusFuture<'a, Subscription> {
        Box::pin(async move { Ok(register(&self.subscribers, subject).await) })
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: Vec<u8>) -> BusFuture<'a, ()> {
        Box::pin(async move {
            dispatch(
                &self.subscribers,
                Message {
                    subject: subject.to_owned(),
                    payload,
                },
            )
            .await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_bus_delivers_to_each_subscriber() {
        let bus = MemoryBus::new();
        let mut first = bus
            .subscribe("agent.a")
            .await
            .unwrap_or_else(|err| panic!("subscribe: {err}"));
        let mut second = bus
            .subscribe("agent.a")
            .await
            .unwrap_or_else(|err| panic!("subscribe: {err}"));
        bus.publish("agent.a", b"hello".to_vec())
            .await
            .unwrap_or_else(|err| panic!("publish: {err}"));

        for subscription in [&mut first, &mut second] {
            let message = subscription
                .next_timeout(Duration::from_secs(1))
                .await
                .unwrap_or_else(|err| panic!("receive: {err}"));
            assert_eq!(message.payload, b"hello".to_vec());
        }
    }

    #[tokio::test]
    async fn unmatched_subject_times_out() {
        let bus = MemoryBus::new();
        let mut subscription = bus
            .subscribe("agent.a")
            .await
            .unwrap_or_else(|err| panic!("subscribe: {err}"));
        bus.publish("agent.b", b"x".to_vec())
            .await
            .unwrap_or_else(|err| panic!("publish: {err}"));
        let err = subscription
            .next_timeout(Duration::from_millis(20))
            .await
            .expect_err("nothing was published on agent.a");
        assert!(matches!(err, BusError::Timeout { .. }));
    }
}
