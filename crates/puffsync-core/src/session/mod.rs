//! Connection session
//!
//! A [`DeviceSession`] owns the link to one counting device at a time and
//! drives everything around it:
//!
//! - Establishing the link (select → open → resolve channel → priming read →
//!   subscribe) and reusing it when it is still alive
//! - Feeding every counter value through the [`CounterReconciler`]
//! - Telling caller teardown apart from unexpected loss, and handing the
//!   latter to the [`ReconnectScheduler`]
//! - Publishing status transitions and puff events on the [`SessionBus`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   open_link    ┌──────────────┐
//! │  Transport  │──────────────► │     Link     │
//! └─────────────┘                └──────────────┘
//!                                        │ LinkEvent stream
//!                                        ▼
//!                               ┌────────────────┐  observe  ┌───────────────────┐
//!                               │ notification   │─────────► │ CounterReconciler │──► BaselineStore
//!                               │ task (1/link)  │           └───────────────────┘
//!                               └────────────────┘                    │ PuffEvent
//!                                        │ lost / ended               ▼
//!                                        ▼                     ┌────────────┐
//!                               ┌────────────────────┐         │ SessionBus │
//!                               │ ReconnectScheduler │────────►│  (status)  │
//!                               └────────────────────┘         └────────────┘
//! ```
//!
//! ## Concurrency
//!
//! - Connect attempts are serialized by an async mutex. A second caller waits
//!   for the first, then re-evaluates (and reuses the link if it may).
//! - User teardown never takes that mutex. It bumps the scheduler generation
//!   instead; an attempt that finishes under a stale generation closes its own
//!   link and fails with [`Error::ConnectAborted`].
//! - Every status transition made on behalf of a connect attempt is
//!   conditional on its generation, so nothing can overwrite the
//!   `Disconnected` that a user teardown settles on.
//! - Background tasks hold a weak reference; dropping the last handle stops
//!   them.
//! - A reading runs through the reconciler on a task of its own. Stopping the
//!   notification consumer (teardown, device switch, drop) never interrupts a
//!   reading between persisting its baseline and publishing its event, and
//!   releasing a link waits for that step through the reconciler lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::bus::{ConnectionStatus, PuffEvent, SessionBus, Subscription};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::reconciler::CounterReconciler;
use crate::scheduler::{ReconnectScheduler, ReconnectStats};
use crate::traits::{
    decode_counter, BaselineStore, DeviceIdentity, Link, LinkEvent, LinkEventStream, Transport,
};

/// The link currently feeding the session
struct ActiveLink {
    id: u64,
    generation: u64,
    device: DeviceIdentity,
    link: Box<dyn Link>,
    notifications: JoinHandle<()>,
}

impl ActiveLink {
    fn is_live(&self) -> bool {
        self.link.is_connected() && !self.notifications.is_finished()
    }
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn BaselineStore>,
    config: SessionConfig,
    bus: SessionBus,
    scheduler: ReconnectScheduler,
    connect_lock: tokio::sync::Mutex<()>,
    reconciler: Arc<tokio::sync::Mutex<CounterReconciler>>,
    active: tokio::sync::Mutex<Option<ActiveLink>>,
    device: Mutex<Option<DeviceIdentity>>,
    last_error: Mutex<Option<String>>,
    next_link_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a device connection session
///
/// Cheap to clone; every clone drives the same session. The session starts
/// `Disconnected` and can be connected, torn down and connected again any
/// number of times.
///
/// ## Lifecycle
///
/// 1. Create with [`DeviceSession::new()`]
/// 2. Subscribe with [`subscribe_status()`](Self::subscribe_status) and
///    [`subscribe_events()`](Self::subscribe_events)
/// 3. [`connect()`](Self::connect), later [`reconnect()`](Self::reconnect)
/// 4. [`shutdown()`](Self::shutdown) before exit
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    /// Create a session over the given transport and baseline store
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn BaselineStore>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let inner = SessionInner {
            transport,
            reconciler: Arc::new(tokio::sync::Mutex::new(CounterReconciler::new(
                store.clone(),
            ))),
            store,
            config,
            bus: SessionBus::new(),
            scheduler: ReconnectScheduler::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            active: tokio::sync::Mutex::new(None),
            device: Mutex::new(None),
            last_error: Mutex::new(None),
            next_link_id: AtomicU64::new(0),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Connect, optionally asking the transport for a new device
    ///
    /// With `select_new_device == false` a live link to the remembered device
    /// is reused, and the remembered device is reconnected otherwise. A device
    /// is selected when asked to or when none was ever selected.
    ///
    /// Errors are returned to the caller and never retried automatically.
    pub async fn connect_device(&self, select_new_device: bool) -> Result<DeviceIdentity> {
        self.inner.connect_internal(select_new_device, None).await
    }

    /// Select a device and connect to it
    pub async fn connect(&self) -> Result<DeviceIdentity> {
        self.connect_device(true).await
    }

    /// Connect to the remembered device, reusing a live link
    pub async fn reconnect(&self) -> Result<DeviceIdentity> {
        self.connect_device(false).await
    }

    /// Release the link
    ///
    /// `user_initiated == true` cancels any pending reconnection, stops
    /// automatic reconnection until the next manual connect, and settles at
    /// `Disconnected`. It is safe to call with nothing connected and does not
    /// wait for an in-flight connect.
    ///
    /// `user_initiated == false` is handled exactly like an unexpected loss of
    /// the live link. Without a live link there is nothing to lose and nothing
    /// is scheduled.
    pub async fn teardown(&self, user_initiated: bool) {
        if user_initiated {
            self.inner.user_teardown().await;
        } else {
            self.inner.simulated_loss().await;
        }
    }

    /// User-initiated teardown
    pub async fn disconnect(&self) {
        self.teardown(true).await;
    }

    /// Disconnect and flush the baseline store
    pub async fn shutdown(&self) -> Result<()> {
        self.disconnect().await;
        self.inner.store.flush().await?;
        info!("Session shut down, baselines flushed");
        Ok(())
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.bus.status()
    }

    /// The most recently selected device, kept across disconnects
    pub fn device(&self) -> Option<DeviceIdentity> {
        lock(&self.inner.device).clone()
    }

    /// Message of the most recent failed connect, cleared when the next attempt starts
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    /// Subscribe to status transitions; the current status comes first
    pub fn subscribe_status(&self) -> Subscription<ConnectionStatus> {
        self.inner.bus.subscribe_status()
    }

    /// Subscribe to puff events emitted from now on
    pub fn subscribe_events(&self) -> Subscription<PuffEvent> {
        self.inner.bus.subscribe_events()
    }

    /// The bus this session publishes on
    pub fn bus(&self) -> &SessionBus {
        &self.inner.bus
    }

    /// Drop the persisted baseline and the in-memory tracking for a device
    ///
    /// Its next reading only establishes a new baseline.
    pub async fn forget_device(&self, device_id: &str) -> Result<()> {
        // Held across the delete so no reading slips in between
        let mut reconciler = self.inner.reconciler.lock().await;
        self.inner.store.delete_baseline(device_id).await?;
        reconciler.forget_live(device_id);
        drop(reconciler);
        info!(device_id, "Forgot device baseline");
        Ok(())
    }

    /// Reconnection timer instrumentation
    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.inner.scheduler.stats()
    }
}

impl SessionInner {
    /// Transition on behalf of work started under `generation`
    ///
    /// Refused once a user teardown has moved the generation on.
    fn publish_if_current(&self, generation: u64, status: ConnectionStatus) -> bool {
        self.scheduler.if_current(generation, || {
            self.bus.publish_status(status);
        })
    }

    fn record_error(&self, err: &Error) {
        *lock(&self.last_error) = Some(err.to_string());
    }

    async fn live_device(&self) -> Option<DeviceIdentity> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|active| active.is_live())
            .map(|active| active.device.clone())
    }

    /// Shared path of manual and scheduled attempts
    ///
    /// `expected_generation` is set for scheduled attempts, which must not
    /// run once a user teardown has happened since they were armed.
    async fn connect_internal(
        self: &Arc<Self>,
        select_new_device: bool,
        expected_generation: Option<u64>,
    ) -> Result<DeviceIdentity> {
        if !self.transport.is_available() {
            let err = Error::transport_unavailable("no radio capability on this host");
            warn!("Cannot connect: {}", err);
            self.record_error(&err);
            return Err(err);
        }

        let _serialized = self.connect_lock.lock().await;

        if expected_generation.is_none() {
            // A manual connect supersedes any pending automatic attempt
            self.scheduler.cancel();
        }
        let generation = self.scheduler.generation();
        if expected_generation.is_some_and(|expected| expected != generation) {
            debug!("Scheduled reconnect superseded by user teardown");
            return Err(Error::ConnectAborted(
                "user teardown before the attempt started".to_string(),
            ));
        }

        *lock(&self.last_error) = None;

        if !select_new_device && let Some(device) = self.live_device().await {
            debug!(device = %device, "Reusing live link");
            self.publish_if_current(generation, ConnectionStatus::Connected);
            return Ok(device);
        }

        self.publish_if_current(generation, ConnectionStatus::Connecting);

        match self.establish(select_new_device, generation).await {
            Ok(device) => {
                info!(device = %device, "Connected");
                Ok(device)
            }
            Err(err) => {
                warn!("Connect failed: {}", err);
                self.record_error(&err);
                // Scheduled attempts leave the outcome to the retry logic
                if expected_generation.is_none() || matches!(err, Error::ConnectAborted(_)) {
                    let settled = if self.live_device().await.is_some() {
                        ConnectionStatus::Connected
                    } else {
                        ConnectionStatus::Disconnected
                    };
                    self.publish_if_current(generation, settled);
                }
                Err(err)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        select_new_device: bool,
        generation: u64,
    ) -> Result<DeviceIdentity> {
        let device = self.resolve_device(select_new_device).await?;

        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            debug!(device = %previous.device, "Replacing existing link");
            self.release(previous, true).await;
        }

        let link = self.transport.open_link(&device).await?;
        let events = match self.prime_and_subscribe(&device, link.as_ref()).await {
            Ok(events) => events,
            Err(err) => {
                close_quietly(link.as_ref()).await;
                return Err(err);
            }
        };

        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let notifications = tokio::spawn(consume_notifications(
            Arc::downgrade(self),
            id,
            device.clone(),
            events,
        ));

        let mut active = self.active.lock().await;
        if self.scheduler.generation() != generation {
            drop(active);
            notifications.abort();
            self.reconciler.lock().await.forget_live(&device.id);
            close_quietly(link.as_ref()).await;
            return Err(Error::ConnectAborted(
                "user teardown while connecting".to_string(),
            ));
        }

        *active = Some(ActiveLink {
            id,
            generation,
            device: device.clone(),
            link,
            notifications,
        });
        self.publish_if_current(generation, ConnectionStatus::Connected);

        Ok(device)
    }

    async fn resolve_device(&self, select_new_device: bool) -> Result<DeviceIdentity> {
        let remembered = lock(&self.device).clone();
        match remembered {
            Some(device) if !select_new_device => Ok(device),
            _ => {
                let device = self
                    .transport
                    .select_device(&self.config.device_filter)
                    .await?;
                info!(device = %device, "Device selected");
                *lock(&self.device) = Some(device.clone());
                Ok(device)
            }
        }
    }

    /// Resolve the channel, reconcile one synchronous read, then subscribe
    async fn prime_and_subscribe(
        &self,
        device: &DeviceIdentity,
        link: &dyn Link,
    ) -> Result<LinkEventStream> {
        let channel = &self.config.counter_channel;
        link.resolve_channel(channel).await?;

        let payload = link.read_value(channel).await?;
        let reading = decode_counter(&payload).ok_or_else(|| {
            Error::handshake(format!(
                "priming read returned {} bytes, expected at least 4",
                payload.len()
            ))
        })?;

        // Held across subscribe so no notification is reconciled before the priming read
        let reconciler = self.reconciler.clone().lock_owned().await;
        let reconciler = self
            .reconcile_detached(reconciler, device, reading)
            .await
            .map_err(|e| Error::Other(format!("priming reconciliation failed: {}", e)))?;
        let events = link.subscribe(channel).await?;
        drop(reconciler);

        Ok(events)
    }

    async fn ingest(&self, device: &DeviceIdentity, payload: &[u8]) {
        let Some(reading) = decode_counter(payload) else {
            warn!(
                device = %device,
                len = payload.len(),
                "Ignoring malformed counter notification"
            );
            return;
        };

        let reconciler = self.reconciler.clone().lock_owned().await;
        if let Err(e) = self.reconcile_detached(reconciler, device, reading).await {
            error!(device = %device, reading, "Reconciliation task failed: {}", e);
        }
    }

    /// Reconcile one reading and publish its event on a task of its own
    ///
    /// The step runs to completion even when the caller is cancelled, so a
    /// persisted baseline is always followed by its event. The guard comes
    /// back once the step is done.
    fn reconcile_detached(
        &self,
        mut reconciler: OwnedMutexGuard<CounterReconciler>,
        device: &DeviceIdentity,
        reading: u32,
    ) -> JoinHandle<OwnedMutexGuard<CounterReconciler>> {
        let bus = self.bus.clone();
        let device = device.clone();
        tokio::spawn(async move {
            match reconciler.observe(&device, reading).await {
                Ok(Some(event)) => bus.publish_event(event),
                Ok(None) => {}
                Err(err) => warn!(
                    device = %device,
                    reading,
                    "Reading not persisted, usage deferred to the next one: {}",
                    err
                ),
            }
            reconciler
        })
    }

    /// Stop the notification task, forget live tracking and close the link
    async fn release(&self, active: ActiveLink, stop_notifications: bool) {
        if stop_notifications {
            active.notifications.abort();
        }
        self.reconciler.lock().await.forget_live(&active.device.id);
        close_quietly(active.link.as_ref()).await;
    }

    async fn user_teardown(&self) {
        self.scheduler.cancel_all(|| {});
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            info!(device = %active.device, "Disconnecting");
            self.release(active, true).await;
        }
        self.bus.publish_status(ConnectionStatus::Disconnected);
    }

    async fn simulated_loss(self: &Arc<Self>) {
        let current = self.active.lock().await.as_ref().map(|active| active.id);
        match current {
            Some(id) => self.handle_link_lost(id, "caller-initiated teardown", false).await,
            // Only a lost live link is retried; whatever is in flight settles the status
            None => debug!("Teardown without a live link, nothing to reconnect"),
        }
    }

    /// Unexpected loss of link `link_id`
    ///
    /// Ignored if that link is no longer the active one (already torn down
    /// or replaced).
    async fn handle_link_lost(self: &Arc<Self>, link_id: u64, reason: &str, from_notifications: bool) {
        let lost = self
            .active
            .lock()
            .await
            .take_if(|active| active.id == link_id);
        let Some(lost) = lost else {
            debug!(link_id, "Loss reported for a link that is no longer active");
            return;
        };

        warn!(device = %lost.device, reason, "Link lost");
        *lock(&self.last_error) = Some(Error::unexpected_disconnect(reason).to_string());
        let generation = lost.generation;
        // The notification task cannot abort itself mid-report
        self.release(lost, !from_notifications).await;
        self.schedule_reconnect(generation, 0, false);
    }

    /// Arm the reconnection timer for attempt number `attempt`
    ///
    /// The first attempt after a loss only arms when nothing is pending.
    fn schedule_reconnect(self: &Arc<Self>, generation: u64, attempt: u32, replace: bool) {
        let delay = self.config.reconnect.delay_for(attempt);
        let session = Arc::downgrade(self);
        let task = async move {
            if let Some(inner) = session.upgrade() {
                inner.run_scheduled_attempt(generation, attempt).await;
            }
        };
        let bus = self.bus.clone();
        let on_armed = move || {
            bus.publish_status(ConnectionStatus::Reconnecting);
        };

        let armed = if replace {
            self.scheduler.arm(generation, delay, task, on_armed)
        } else {
            self.scheduler.arm_if_idle(generation, delay, task, on_armed)
        };
        if armed {
            info!(attempt = attempt + 1, ?delay, "Reconnect scheduled");
        }
    }

    async fn run_scheduled_attempt(self: Arc<Self>, generation: u64, attempt: u32) {
        debug!(attempt = attempt + 1, "Running scheduled reconnect");
        match self.connect_internal(false, Some(generation)).await {
            Ok(device) => info!(device = %device, attempt = attempt + 1, "Reconnected"),
            Err(Error::ConnectAborted(_)) => {}
            Err(err)
                if err.is_transient() && self.config.reconnect.allows_attempt(attempt + 1) =>
            {
                self.schedule_reconnect(generation, attempt + 1, true);
            }
            Err(err) => {
                warn!(attempts = attempt + 1, "Giving up on reconnecting: {}", err);
                self.publish_if_current(generation, ConnectionStatus::Disconnected);
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.scheduler.cancel();
        if let Some(active) = self.active.get_mut().take() {
            active.notifications.abort();
        }
    }
}

/// The single consumer of one link's notifications
async fn consume_notifications(
    session: Weak<SessionInner>,
    link_id: u64,
    device: DeviceIdentity,
    mut events: LinkEventStream,
) {
    let reason = loop {
        match events.next().await {
            Some(LinkEvent::Value(payload)) => {
                let Some(inner) = session.upgrade() else {
                    return;
                };
                inner.ingest(&device, &payload).await;
            }
            Some(LinkEvent::Lost { reason }) => break reason,
            None => break "notification stream ended".to_string(),
        }
    };

    if let Some(inner) = session.upgrade() {
        inner.handle_link_lost(link_id, &reason, true).await;
    }
}

async fn close_quietly(link: &dyn Link) {
    if let Err(err) = link.disconnect().await {
        debug!("Error while closing link: {}", err);
    }
}
