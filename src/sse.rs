//! Server-sent-events change feed.
//!
//! Opens `GET {stream_url}?channel={id}` and turns every event on the
//! stream into a [`ChangeEvent`]. Dropped connections are re-established
//! with exponential backoff until the subscription is closed, and each
//! successful (re)connect is announced with [`FeedSignal::Connected`].

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event, Eventsource};
use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::feed::{ChangeEvent, ChangeFeed, ChangeKind, FeedSignal, Subscription};
use crate::FlagError;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Reconnect {
    base_delay: Duration,
    max_delay: Duration,
    // 0 = unlimited
    max_attempts: u32,
}

impl Reconnect {
    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u64.saturating_pow(failures.min(10));
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as u64))
    }
}

#[derive(Clone)]
pub struct SseChangeFeed {
    stream_url: String,
    http_client: reqwest::Client,
    headers: HeaderMap,
    reconnect: Reconnect,
}

impl SseChangeFeed {
    pub fn builder() -> SseChangeFeedBuilder {
        SseChangeFeedBuilder::new()
    }

    async fn connect(&self, channel: &str) -> Result<reqwest::Response, FlagError> {
        let mut url = reqwest::Url::parse(&self.stream_url)
            .map_err(|e| FlagError::ConfigError(format!("Invalid stream URL: {}", e)))?;
        url.query_pairs_mut().append_pair("channel", channel);

        let response = self
            .http_client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FlagError::SubscriptionError(format!(
                "Unexpected status code: {}",
                response.status()
            )));
        }

        Ok(response)
    }

    async fn run(self, channel: String, first: reqwest::Response, tx: mpsc::UnboundedSender<FeedSignal>) {
        let mut pending = Some(first);
        let mut failures: u32 = 0;

        loop {
            let connected = match pending.take() {
                Some(response) => Ok(response),
                None => self.connect(&channel).await,
            };

            match connected {
                Ok(response) => {
                    failures = 0;
                    if tx.send(FeedSignal::Connected).is_err() {
                        break;
                    }
                    match forward_events(response, &tx).await {
                        Ok(()) => debug!("Change stream for {} ended", channel),
                        Err(e) => {
                            error!("Change stream for {} failed: {}", channel, e);
                            failures += 1;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to reconnect change stream for {}: {}", channel, e);
                    failures += 1;
                }
            }

            if tx.is_closed() {
                break;
            }

            if self.reconnect.max_attempts > 0 && failures >= self.reconnect.max_attempts {
                error!(
                    "Giving up on change stream for {} after {} failures",
                    channel, failures
                );
                break;
            }

            let delay = self.reconnect.delay_for(failures);
            warn!(
                "Reconnecting change stream for {} in {}ms",
                channel,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ChangeFeed for SseChangeFeed {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, FlagError> {
        let response = self.connect(channel).await?;
        info!("Change stream connected on channel {}", channel);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.clone().run(channel.to_string(), response, tx));

        Ok(Subscription::new(channel, rx).with_task(task))
    }
}

async fn forward_events(
    response: reqwest::Response,
    tx: &mpsc::UnboundedSender<FeedSignal>,
) -> Result<(), FlagError> {
    let mut events = response.bytes_stream().eventsource();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| FlagError::SubscriptionError(e.to_string()))?;
        if let Some(change) = to_change_event(&event) {
            if tx.send(FeedSignal::Changed(change)).is_err() {
                return Ok(());
            }
        }
    }

    Ok(())
}

fn to_change_event(event: &Event) -> Option<ChangeEvent> {
    if event.event.eq_ignore_ascii_case("heartbeat") {
        return None;
    }

    let payload = if event.data.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&event.data).unwrap_or_else(|_| Value::String(event.data.clone()))
    };

    let kind = if !event.event.is_empty() && event.event != "message" {
        ChangeKind::parse(&event.event)
    } else {
        payload
            .get("eventType")
            .or_else(|| payload.get("type"))
            .and_then(Value::as_str)
            .map(ChangeKind::parse)
            .unwrap_or_else(|| ChangeKind::Other("message".to_string()))
    };

    Some(ChangeEvent::new(kind, payload))
}

pub struct SseChangeFeedBuilder {
    stream_url: Option<String>,
    api_key: Option<String>,
    reconnect: Reconnect,
}

impl SseChangeFeedBuilder {
    fn new() -> Self {
        Self {
            stream_url: None,
            api_key: None,
            reconnect: Reconnect {
                base_delay: DEFAULT_RECONNECT_DELAY,
                max_delay: DEFAULT_MAX_RECONNECT_DELAY,
                max_attempts: 0,
            },
        }
    }

    pub fn with_stream_url(mut self, stream_url: &str) -> Self {
        self.stream_url = Some(stream_url.to_string());
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.base_delay = delay;
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.max_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    pub fn build(self) -> Result<SseChangeFeed, FlagError> {
        let stream_url = match self.stream_url {
            Some(url) if !url.is_empty() => url,
            _ => return Err(FlagError::ConfigError("Stream URL is required".to_string())),
        };

        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_static("Flagstore-Rust"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(api_key) = &self.api_key {
            let key = HeaderValue::from_str(api_key)
                .map_err(|_| FlagError::ConfigError("API key is not a valid header value".to_string()))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| FlagError::ConfigError("API key is not a valid header value".to_string()))?;
            headers.insert("apikey", key);
            headers.insert(AUTHORIZATION, bearer);
        }

        // No overall timeout: the stream stays open indefinitely.
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(SseChangeFeed {
            stream_url,
            http_client,
            headers,
            reconnect: self.reconnect,
        })
    }
}
