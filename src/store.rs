use std::future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::StoreConfig;
use crate::feed::{ChangeFeed, FeedSignal, Subscription};
use crate::flag::FlagSnapshot;
use crate::source::FlagSource;
use crate::FlagError;

static MOUNT_COUNTER: AtomicU64 = AtomicU64::new(0);

type SharedSource = Arc<dyn FlagSource + Send + Sync>;
type SharedFeed = Arc<dyn ChangeFeed + Send + Sync>;

/// Locally cached view of the remote flag table.
///
/// Mounting a store starts a driver task that performs the initial load,
/// waits for the settling delay and then subscribes to change
/// notifications. Every notification after the first `skip_events`
/// re-arms a single-slot debounce timer; when it fires the whole table is
/// fetched again. Reads never block and fail closed.
pub struct FlagStore {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
    channel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    ScheduleRefresh,
    CancelRefresh,
}

struct Shared {
    source: SharedSource,
    snapshot: watch::Sender<Arc<FlagSnapshot>>,
    loading: AtomicBool,
    initial_done: AtomicBool,
    // Number of fetches currently running; a forced initial fetch may overlap another.
    in_flight: AtomicUsize,
    alive: AtomicBool,
    subscribed: AtomicBool,
    error: RwLock<Option<String>>,
    last_refreshed: RwLock<Option<DateTime<Utc>>>,
}

impl Shared {
    fn new(source: SharedSource) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(FlagSnapshot::new()));
        Self {
            source,
            snapshot,
            loading: AtomicBool::new(true),
            initial_done: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            subscribed: AtomicBool::new(false),
            error: RwLock::new(None),
            last_refreshed: RwLock::new(None),
        }
    }

    async fn refetch(&self, initial: bool) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if running > 0 && !initial {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            debug!("Flag fetch already in flight, skipping refresh");
            return;
        }
        // Released on every exit, including when this future is dropped mid-fetch.
        let _guard = FetchGuard { shared: self, initial };

        if initial {
            self.loading.store(true, Ordering::SeqCst);
        }

        let result = self.source.fetch_all().await;

        if !self.alive.load(Ordering::SeqCst) {
            debug!("Discarding flag fetch that resolved after dispose");
            return;
        }

        match result {
            Ok(rows) => {
                self.apply(FlagSnapshot::from_rows(&rows), initial);
                self.set_error(None);
                write_lock(&self.last_refreshed, Some(Utc::now()));
            }
            Err(e) => {
                error!("Failed to fetch feature flags: {}", e);
                self.set_error(Some(e.to_string()));
                if initial {
                    self.snapshot.send_if_modified(|current| {
                        if current.is_empty() {
                            return false;
                        }
                        *current = Arc::new(FlagSnapshot::new());
                        true
                    });
                }
            }
        }
    }

    fn is_fetching(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    fn apply(&self, fresh: FlagSnapshot, initial: bool) {
        self.snapshot.send_if_modified(|current| {
            if !fresh.differs_from(current) {
                debug!("Flag refresh returned no changes");
                return false;
            }
            if fresh.is_empty() && !initial {
                warn!(
                    "Flag refresh returned no rows, keeping previous {} flags",
                    current.len()
                );
                return false;
            }

            debug!("Replacing flag snapshot ({} -> {} flags)", current.len(), fresh.len());
            *current = Arc::new(fresh);
            true
        });
    }

    fn set_error(&self, message: Option<String>) {
        write_lock(&self.error, message);
    }

    fn current(&self) -> Arc<FlagSnapshot> {
        self.snapshot.borrow().clone()
    }
}

struct FetchGuard<'a> {
    shared: &'a Shared,
    initial: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if self.initial {
            self.shared.loading.store(false, Ordering::SeqCst);
            self.shared.initial_done.store(true, Ordering::SeqCst);
        }
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn write_lock<T>(lock: &RwLock<T>, value: T) {
    match lock.write() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn read_lock<T: Clone>(lock: &RwLock<T>) -> T {
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

impl FlagStore {
    pub fn builder() -> FlagStoreBuilder {
        FlagStoreBuilder::new()
    }

    /// `true` only if the current snapshot maps `name` to `true`.
    ///
    /// Always `false` while the initial load is running and after
    /// [`dispose`](FlagStore::dispose).
    pub fn is_enabled(&self, name: &str) -> bool {
        if self.loading() || self.is_disposed() {
            return false;
        }
        self.shared.snapshot.borrow().is_enabled(name)
    }

    /// Current snapshot. The same `Arc` is handed out until a refresh
    /// actually changes something.
    pub fn flags(&self) -> Arc<FlagSnapshot> {
        self.shared.current()
    }

    /// Notified whenever the snapshot object is replaced.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FlagSnapshot>> {
        self.shared.snapshot.subscribe()
    }

    pub fn enabled_flags(&self) -> Vec<String> {
        if self.loading() || self.is_disposed() {
            return Vec::new();
        }
        self.flags().enabled_names()
    }

    pub fn loading(&self) -> bool {
        self.shared.loading.load(Ordering::SeqCst)
    }

    /// Message of the last failed fetch; cleared by the next success.
    pub fn error(&self) -> Option<String> {
        read_lock(&self.shared.error)
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        read_lock(&self.shared.last_refreshed)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel
    }

    pub fn is_disposed(&self) -> bool {
        !self.shared.alive.load(Ordering::SeqCst)
    }

    /// Whether a change subscription is currently open.
    pub fn is_subscribed(&self) -> bool {
        !self.is_disposed() && self.shared.subscribed.load(Ordering::SeqCst)
    }

    pub fn debug_info(&self) -> String {
        format!(
            "FlagStore {{ channel: {}, flags: {}, loading: {}, subscribed: {}, disposed: {}, error: {:?} }}",
            self.channel,
            self.flags().len(),
            self.loading(),
            self.is_subscribed(),
            self.is_disposed(),
            self.error()
        )
    }

    /// Fetches the table now. A non-initial call is skipped while another
    /// fetch is in flight.
    pub async fn refetch(&self, initial: bool) {
        self.shared.refetch(initial).await;
    }

    /// Arms (or re-arms) the debounce timer as if a change notification
    /// had arrived.
    pub fn schedule_refresh(&self) {
        let _ = self.commands.send(Command::ScheduleRefresh);
    }

    pub fn cancel_scheduled_refresh(&self) {
        let _ = self.commands.send(Command::CancelRefresh);
    }

    /// Stops the driver, cancels any pending refresh and closes the
    /// subscription. Fetches resolving afterwards are ignored.
    pub async fn dispose(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);

        let handle = match self.driver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Flag store on channel {} disposed", self.channel);
        }
    }
}

impl Drop for FlagStore {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let handle = match self.driver.get_mut() {
            Ok(handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Single-slot debounce timer: scheduling replaces any pending deadline.
#[derive(Debug)]
struct RefreshTimer {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl RefreshTimer {
    fn new(quiet: Duration) -> Self {
        Self { quiet, deadline: None }
    }

    fn schedule(&mut self) {
        self.deadline = Some(Instant::now() + self.quiet);
    }

    fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

struct Driver {
    shared: Arc<Shared>,
    feed: Option<SharedFeed>,
    config: StoreConfig,
    channel: String,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        self.shared.refetch(true).await;

        let settle = tokio::time::sleep(self.config.settle_delay);
        tokio::pin!(settle);

        let mut settled = false;
        let mut subscription: Option<Subscription> = None;
        let mut skipped = 0usize;
        let mut timer = RefreshTimer::new(self.config.debounce);

        loop {
            let deadline = timer.deadline();

            tokio::select! {
                _ = &mut settle, if !settled => {
                    settled = true;
                    skipped = 0;
                    subscription = open_subscription(self.feed.as_ref(), &self.shared, &self.channel).await;
                    self.shared.subscribed.store(subscription.is_some(), Ordering::SeqCst);
                    if subscription.is_none() && self.wants_subscription() {
                        settle.as_mut().reset(Instant::now() + self.config.settle_delay);
                        settled = false;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::ScheduleRefresh) => timer.schedule(),
                    Some(Command::CancelRefresh) => {
                        if timer.cancel() {
                            debug!("Cancelled scheduled flag refresh");
                        }
                    }
                    None => break,
                },
                signal = next_signal(&mut subscription), if subscription.is_some() => match signal {
                    Some(FeedSignal::Connected) => {
                        if skipped > 0 {
                            debug!("Change feed reconnected on {}, restarting skip count", self.channel);
                        }
                        skipped = 0;
                    }
                    Some(FeedSignal::Changed(event)) => {
                        if skipped < self.config.skip_events {
                            skipped += 1;
                            debug!("Discarding {} notification {} after subscribe", event.kind, skipped);
                        } else {
                            debug!("Flag table changed ({}), scheduling refresh", event.kind);
                            timer.schedule();
                        }
                    }
                    None => {
                        subscription = None;
                        self.shared.subscribed.store(false, Ordering::SeqCst);
                        if self.wants_subscription() {
                            warn!(
                                "Change feed closed channel {}, resubscribing in {}ms",
                                self.channel,
                                self.config.settle_delay.as_millis()
                            );
                            settle.as_mut().reset(Instant::now() + self.config.settle_delay);
                            settled = false;
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    timer.cancel();
                    self.fire_refresh();
                }
            }
        }

        timer.cancel();
        self.shared.subscribed.store(false, Ordering::SeqCst);
        if let Some(mut subscription) = subscription.take() {
            subscription.close();
            info!("Closed flag subscription on {}", self.channel);
        }
    }

    fn wants_subscription(&self) -> bool {
        self.feed.is_some() && self.shared.alive.load(Ordering::SeqCst)
    }

    fn fire_refresh(&self) {
        if !self.shared.initial_done.load(Ordering::SeqCst) {
            debug!("Initial flag load not complete, dropping scheduled refresh");
            return;
        }
        if self.shared.is_fetching() {
            debug!("Flag fetch already in flight, dropping scheduled refresh");
            return;
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.refetch(false).await;
        });
    }
}

async fn open_subscription(
    feed: Option<&SharedFeed>,
    shared: &Shared,
    channel: &str,
) -> Option<Subscription> {
    let feed = feed?;
    if !shared.alive.load(Ordering::SeqCst) {
        return None;
    }

    match feed.subscribe(channel).await {
        Ok(subscription) => {
            info!("Subscribed to flag changes on {}", channel);
            Some(subscription)
        }
        Err(e) => {
            error!("Failed to subscribe to flag changes on {}: {}", channel, e);
            None
        }
    }
}

async fn next_signal(subscription: &mut Option<Subscription>) -> Option<FeedSignal> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => future::pending().await,
    }
}

pub struct FlagStoreBuilder {
    source: Option<SharedSource>,
    feed: Option<SharedFeed>,
    config: StoreConfig,
}

impl FlagStoreBuilder {
    fn new() -> Self {
        Self {
            source: None,
            feed: None,
            config: StoreConfig::default(),
        }
    }

    pub fn with_source<S>(mut self, source: S) -> Self
    where
        S: FlagSource + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Without a feed the store only refreshes on demand.
    pub fn with_feed<F>(mut self, feed: F) -> Self
    where
        F: ChangeFeed + Send + Sync + 'static,
    {
        self.feed = Some(Arc::new(feed));
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the driver task. Must be called inside a Tokio runtime.
    pub fn mount(self) -> Result<FlagStore, FlagError> {
        let source = self
            .source
            .ok_or_else(|| FlagError::ConfigError("A flag source is required".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| FlagError::ConfigError("Mounting a flag store requires a Tokio runtime".to_string()))?;

        let channel = format!(
            "{}-{}-{}-{}",
            self.config.channel_prefix,
            std::process::id(),
            Utc::now().timestamp_millis(),
            MOUNT_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let shared = Arc::new(Shared::new(source));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            shared: Arc::clone(&shared),
            feed: self.feed,
            config: self.config,
            channel: channel.clone(),
            commands: command_rx,
        };
        let handle = runtime.spawn(driver.run());

        Ok(FlagStore {
            shared,
            commands,
            driver: Mutex::new(Some(handle)),
            channel,
        })
    }
}
