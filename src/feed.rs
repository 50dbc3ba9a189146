use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::FlagError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Other(String),
}

impl ChangeKind {
    pub fn parse(kind: &str) -> Self {
        match kind.to_ascii_uppercase().as_str() {
            "INSERT" => ChangeKind::Insert,
            "UPDATE" => ChangeKind::Update,
            "DELETE" => ChangeKind::Delete,
            _ => ChangeKind::Other(kind.to_string()),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
            ChangeKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

/// "Something changed in the flag table."
///
/// The payload is carried for logging only; the store always re-fetches
/// the whole table instead of applying it as a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub payload: Value,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn update(payload: Value) -> Self {
        Self::new(ChangeKind::Update, payload)
    }
}

/// What a subscription delivers.
///
/// `Connected` is sent each time the transport (re)establishes its
/// connection, so the consumer can restart its post-subscribe skip count.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Connected,
    Changed(ChangeEvent),
}

/// An open subscription on one channel.
///
/// Events arrive on an internal queue. Closing (or dropping) the
/// subscription stops delivery and tears down any transport task.
pub struct Subscription {
    channel: String,
    events: mpsc::UnboundedReceiver<FeedSignal>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(channel: &str, events: mpsc::UnboundedReceiver<FeedSignal>) -> Self {
        Self {
            channel: channel.to_string(),
            events,
            task: None,
        }
    }

    /// Ties a background transport task to this subscription's lifetime.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next signal, or `None` once the feed has closed the channel.
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Push-notification channel for insert/update/delete events on the flag table.
#[async_trait]
pub trait ChangeFeed {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, FlagError>;
}

/// In-process change feed.
///
/// Anything that learns about flag changes (a webhook handler, a database
/// listener, a test) calls [`MemoryFeed::notify`] and every open
/// subscription receives the event.
#[derive(Clone, Default)]
pub struct MemoryFeed {
    subscribers: Arc<Mutex<Vec<(String, mpsc::UnboundedSender<FeedSignal>)>>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every open subscription; returns how many got it.
    pub fn notify(&self, event: ChangeEvent) -> usize {
        self.broadcast(FeedSignal::Changed(event))
    }

    /// Tells every open subscription its connection was re-established.
    pub fn notify_reconnected(&self) -> usize {
        self.broadcast(FeedSignal::Connected)
    }

    /// Closes every open channel from the feed side.
    pub fn close_channels(&self) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.clear();
    }

    fn broadcast(&self, signal: FeedSignal) -> usize {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (channel, tx) in subscribers.iter() {
            if tx.send(signal.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!("Channel {} closed during delivery", channel);
            }
        }
        delivered
    }

    /// Channel ids with a live subscriber.
    pub fn open_channels(&self) -> Vec<String> {
        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(channel, _)| channel.clone())
            .collect()
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, FlagError> {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|(_, tx)| !tx.is_closed());

        if subscribers.iter().any(|(open, _)| open == channel) {
            return Err(FlagError::SubscriptionError(format!(
                "Channel {} is already subscribed",
                channel
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.push((channel.to_string(), tx));
        Ok(Subscription::new(channel, rx))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_change_kind_parse() {
        assert_eq!(ChangeKind::parse("insert"), ChangeKind::Insert);
        assert_eq!(ChangeKind::parse("UPDATE"), ChangeKind::Update);
        assert_eq!(ChangeKind::parse("Delete"), ChangeKind::Delete);
        assert_eq!(ChangeKind::parse("system"), ChangeKind::Other("system".to_string()));
        assert_eq!(ChangeKind::Other("system".to_string()).to_string(), "system");
    }

    #[tokio::test]
    async fn test_memory_feed_delivers_to_open_subscriptions() {
        let feed = MemoryFeed::new();
        let mut first = feed.subscribe("flags-1").await.unwrap();
        let mut second = feed.subscribe("flags-2").await.unwrap();

        let delivered = feed.notify(ChangeEvent::update(json!({"name": "a"})));
        assert_eq!(delivered, 2);

        match first.recv().await.unwrap() {
            FeedSignal::Changed(event) => assert_eq!(event.kind, ChangeKind::Update),
            other => panic!("unexpected signal: {:?}", other),
        }
        match second.recv().await.unwrap() {
            FeedSignal::Changed(event) => assert_eq!(event.payload["name"], "a"),
            other => panic!("unexpected signal: {:?}", other),
        }

        assert_eq!(feed.notify_reconnected(), 2);
        assert_eq!(first.recv().await.unwrap(), FeedSignal::Connected);
    }

    #[tokio::test]
    async fn test_memory_feed_rejects_duplicate_channel() {
        let feed = MemoryFeed::new();
        let _open = feed.subscribe("flags-1").await.unwrap();

        let err = feed.subscribe("flags-1").await.err().unwrap();
        assert!(matches!(err, FlagError::SubscriptionError(_)));
    }

    #[tokio::test]
    async fn test_feed_side_close_ends_subscription() {
        let feed = MemoryFeed::new();
        let mut subscription = feed.subscribe("flags-1").await.unwrap();

        feed.close_channels();

        assert!(subscription.recv().await.is_none());
        assert!(feed.open_channels().is_empty());
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_delivery() {
        let feed = MemoryFeed::new();
        let mut subscription = feed.subscribe("flags-1").await.unwrap();
        assert_eq!(feed.open_channels(), vec!["flags-1".to_string()]);

        subscription.close();
        assert!(feed.open_channels().is_empty());
        assert_eq!(feed.notify(ChangeEvent::update(Value::Null)), 0);

        drop(subscription);
        assert!(feed.subscribe("flags-1").await.is_ok());
    }
}
