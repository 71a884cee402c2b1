//! Test doubles and common utilities for contract tests
//!
//! The doubles stand in for the radio stack and the baseline store. They
//! record what the session asks of them and let a test push counter values,
//! drop the link, or script failures at any point.

#![allow(dead_code)]

use puffsync_core::bus::Subscription;
use puffsync_core::error::{Error, Result};
use puffsync_core::traits::{
    BaselineRecord, BaselineStore, CounterChannel, DeviceFilter, DeviceIdentity, Link, LinkEvent,
    LinkEventStream,
};
use puffsync_core::{
    ConnectionStatus, DeviceSession, MemoryBaselineStore, ReconnectPolicy, SessionConfig,
    Transport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const DEVICE_ID: &str = "C4:7F:51:0A:22:9E";

pub fn device() -> DeviceIdentity {
    DeviceIdentity::new(DEVICE_ID).with_name("Purifier-ACQD-01")
}

#[derive(Default)]
struct Shared {
    unavailable: AtomicBool,
    counter: AtomicU32,
    read_payload: Mutex<Option<Vec<u8>>>,
    select_calls: AtomicUsize,
    open_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    select_failures: Mutex<VecDeque<Error>>,
    open_failures: Mutex<VecDeque<Error>>,
    selection_gate: Mutex<Option<oneshot::Receiver<()>>>,
    link_tx: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    link_connected: Mutex<Option<Arc<AtomicBool>>>,
    log: Mutex<Vec<&'static str>>,
}

impl Shared {
    fn record(&self, step: &'static str) {
        self.log.lock().unwrap().push(step);
    }
}

/// A radio stack driven by the test
///
/// Clones share all state, so a test keeps one clone and hands another to
/// the session.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// A transport whose device reports `counter` on the priming read
    pub fn new(counter: u32) -> Self {
        let transport = Self::default();
        transport.set_counter(counter);
        transport
    }

    /// Set the value the next priming read returns
    pub fn set_counter(&self, value: u32) {
        self.shared.counter.store(value, Ordering::SeqCst);
    }

    /// Make the priming read return these raw bytes instead of the counter
    pub fn set_read_payload(&self, payload: Vec<u8>) {
        *self.shared.read_payload.lock().unwrap() = Some(payload);
    }

    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `select_device` call with `err`
    pub fn fail_next_select(&self, err: Error) {
        self.shared.select_failures.lock().unwrap().push_back(err);
    }

    /// Fail the next `count` `open_link` calls with errors built by `make`
    pub fn fail_opens(&self, count: usize, make: fn() -> Error) {
        let mut failures = self.shared.open_failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(make());
        }
    }

    /// Block `select_device` until the returned sender fires (or is dropped)
    pub fn hold_selection(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.shared.selection_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Push a counter notification on the live link
    pub fn push_counter(&self, value: u32) {
        self.push_raw(value.to_le_bytes().to_vec());
    }

    /// Push raw notification bytes on the live link
    pub fn push_raw(&self, payload: Vec<u8>) {
        if let Some(tx) = self.shared.link_tx.lock().unwrap().as_ref() {
            let _ = tx.send(LinkEvent::Value(payload));
        }
    }

    /// The peer goes away
    pub fn drop_link(&self, reason: &str) {
        if let Some(connected) = self.shared.link_connected.lock().unwrap().take() {
            connected.store(false, Ordering::SeqCst);
        }
        if let Some(tx) = self.shared.link_tx.lock().unwrap().take() {
            let _ = tx.send(LinkEvent::Lost {
                reason: reason.to_string(),
            });
        }
    }

    pub fn select_call_count(&self) -> usize {
        self.shared.select_calls.load(Ordering::SeqCst)
    }

    pub fn open_call_count(&self) -> usize {
        self.shared.open_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_call_count(&self) -> usize {
        self.shared.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Link-level steps in the order the session performed them
    pub fn log(&self) -> Vec<&'static str> {
        self.shared.log.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn is_available(&self) -> bool {
        !self.shared.unavailable.load(Ordering::SeqCst)
    }

    async fn select_device(&self, _filter: &DeviceFilter) -> Result<DeviceIdentity> {
        self.shared.select_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.shared.selection_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(err) = self.shared.select_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(device())
    }

    async fn open_link(&self, _device: &DeviceIdentity) -> Result<Box<dyn Link>> {
        self.shared.open_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.record("open");
        if let Some(err) = self.shared.open_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let connected = Arc::new(AtomicBool::new(true));
        *self.shared.link_connected.lock().unwrap() = Some(connected.clone());
        Ok(Box::new(MockLink {
            shared: self.shared.clone(),
            connected,
        }))
    }
}

struct MockLink {
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Link for MockLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn resolve_channel(&self, channel: &CounterChannel) -> Result<()> {
        self.shared.record("resolve");
        if *channel != CounterChannel::default() {
            return Err(Error::handshake("counter characteristic not found"));
        }
        Ok(())
    }

    async fn read_value(&self, _channel: &CounterChannel) -> Result<Vec<u8>> {
        self.shared.record("read");
        if let Some(payload) = self.shared.read_payload.lock().unwrap().clone() {
            return Ok(payload);
        }
        Ok(self.shared.counter.load(Ordering::SeqCst).to_le_bytes().to_vec())
    }

    async fn subscribe(&self, _channel: &CounterChannel) -> Result<LinkEventStream> {
        self.shared.record("subscribe");
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.link_tx.lock().unwrap() = Some(tx);
        Ok(Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)))
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.record("disconnect");
        if self.connected.swap(false, Ordering::SeqCst) {
            self.shared.link_tx.lock().unwrap().take();
        }
        Ok(())
    }
}

/// A baseline store that tracks calls and can be told to fail writes
#[derive(Clone, Default)]
pub struct MockBaselineStore {
    inner: MemoryBaselineStore,
    set_call_count: Arc<AtomicUsize>,
    flush_call_count: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
    write_delay_ms: Arc<AtomicU64>,
    delete_gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
}

impl MockBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `value` for the test device
    pub fn seeded(value: u32) -> Self {
        Self {
            inner: MemoryBaselineStore::with_baselines([(device(), value)]),
            ..Self::default()
        }
    }

    pub fn set_call_count(&self) -> usize {
        self.set_call_count.load(Ordering::SeqCst)
    }

    pub fn flush_call_count(&self) -> usize {
        self.flush_call_count.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Acknowledge every write `delay` after it landed, like a slow disk sync
    pub fn delay_writes(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Block the next `delete_baseline` until the returned sender fires (or is dropped)
    pub fn hold_delete(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.delete_gate.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait::async_trait]
impl BaselineStore for MockBaselineStore {
    async fn get_baseline(&self, device_id: &str) -> Result<Option<u32>> {
        self.inner.get_baseline(device_id).await
    }

    async fn get_record(&self, device_id: &str) -> Result<Option<BaselineRecord>> {
        self.inner.get_record(device_id).await
    }

    async fn set_baseline(&self, device: &DeviceIdentity, value: u32) -> Result<()> {
        self.set_call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::baseline_store("write refused by test"));
        }
        self.inner.set_baseline(device, value).await?;
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn delete_baseline(&self, device_id: &str) -> Result<()> {
        let gate = self.delete_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.inner.delete_baseline(device_id).await
    }

    async fn list_devices(&self) -> Result<Vec<String>> {
        self.inner.list_devices().await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_call_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config with the firmware's fixed 1.2s reconnect delay
pub fn test_config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(1200)),
        ..SessionConfig::default()
    }
}

pub fn session_with(
    transport: &MockTransport,
    store: &MockBaselineStore,
    config: SessionConfig,
) -> DeviceSession {
    DeviceSession::new(Arc::new(transport.clone()), Arc::new(store.clone()), config)
        .expect("session construction succeeds")
}

pub fn session(transport: &MockTransport, store: &MockBaselineStore) -> DeviceSession {
    session_with(transport, store, test_config())
}

/// Let spawned tasks run without reaching any reconnect timer
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Everything queued on a subscription right now, after letting tasks run
pub async fn drained<T>(subscription: &mut Subscription<T>) -> Vec<T> {
    settle().await;
    subscription.drain()
}

/// Wait (in virtual time) until the session reports `status`
pub async fn wait_for_status(session: &DeviceSession, status: ConnectionStatus) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while session.status() != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status never became {status}"));
}
