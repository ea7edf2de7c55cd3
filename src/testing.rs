// In-memory radio and link used by the unit tests

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::Semaphore;

use crate::error::BleError;
use crate::protocol::{ScratchBank, SERIAL_CHARACTERISTIC};
use crate::transport::{Advertisement, Link, Radio};

fn not_connected() -> BleError {
    BleError::Bluetooth(bluer::Error {
        kind: bluer::ErrorKind::Failed,
        message: "not connected".to_string(),
    })
}

pub fn advertisement(id: &str, local_name: Option<&str>) -> Advertisement {
    Advertisement {
        id: id.to_string(),
        local_name: local_name.map(str::to_string),
    }
}

/// Yields `advertisements`, then stays open like a live scan. Sets
/// `stopped` when dropped.
pub fn scan_stream(
    advertisements: Vec<Advertisement>,
    stopped: Arc<AtomicBool>,
) -> BoxStream<'static, Advertisement> {
    ScanStream {
        inner: stream::iter(advertisements).chain(stream::pending()).boxed(),
        stopped,
    }
    .boxed()
}

struct ScanStream {
    inner: BoxStream<'static, Advertisement>,
    stopped: Arc<AtomicBool>,
}

impl Stream for ScanStream {
    type Item = Advertisement;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct FakeRadio {
    advertisements: Vec<Advertisement>,
    gate: Option<Semaphore>,
    scans: AtomicUsize,
    connects: AtomicUsize,
    scan_stopped: Mutex<Arc<AtomicBool>>,
    fail_negotiation: AtomicBool,
    share_connections: AtomicBool,
    connections: Mutex<HashMap<String, Arc<AtomicBool>>>,
    disconnect_delay: Mutex<Duration>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeRadio {
    pub fn new(advertisements: Vec<Advertisement>) -> Arc<Self> {
        Arc::new(Self::build(advertisements, None))
    }

    /// Connections block until [`FakeRadio::open`] hands out permits.
    pub fn gated(advertisements: Vec<Advertisement>) -> Arc<Self> {
        Arc::new(Self::build(advertisements, Some(Semaphore::new(0))))
    }

    fn build(advertisements: Vec<Advertisement>, gate: Option<Semaphore>) -> Self {
        FakeRadio {
            advertisements,
            gate,
            scans: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            scan_stopped: Mutex::new(Arc::new(AtomicBool::new(false))),
            fail_negotiation: AtomicBool::new(false),
            share_connections: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            disconnect_delay: Mutex::new(Duration::ZERO),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn open(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    /// Links to the same address share one connection, as with BlueZ:
    /// disconnecting any of them disconnects all of them.
    pub fn share_connections(&self) {
        self.share_connections.store(true, Ordering::SeqCst);
    }

    pub fn delay_disconnect(&self, delay: Duration) {
        *self.disconnect_delay.lock().unwrap() = delay;
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn scan_stopped(&self) -> bool {
        self.scan_stopped.lock().unwrap().load(Ordering::SeqCst)
    }

    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().unwrap().clone()
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn scan(&self) -> Result<BoxStream<'static, Advertisement>, BleError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let stopped = Arc::new(AtomicBool::new(false));
        *self.scan_stopped.lock().unwrap() = stopped.clone();
        Ok(scan_stream(self.advertisements.clone(), stopped))
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<Arc<dyn Link>, BleError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| not_connected())?
                .forget();
        }
        let connection = if self.share_connections.load(Ordering::SeqCst) {
            let mut connections = self.connections.lock().unwrap();
            let connection = connections
                .entry(advertisement.id.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false)));
            if connection.load(Ordering::SeqCst) {
                *connection = Arc::new(AtomicBool::new(false));
            }
            connection.clone()
        } else {
            Arc::new(AtomicBool::new(false))
        };
        let delay = *self.disconnect_delay.lock().unwrap();
        let link = FakeLink::build(&advertisement.id, connection, delay);
        if self.fail_negotiation.load(Ordering::SeqCst) {
            link.fail_negotiation.store(true, Ordering::SeqCst);
        }
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

pub struct FakeLink {
    id: String,
    writes: Mutex<Vec<Vec<u8>>>,
    serial_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    serial_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    scratch: Mutex<HashMap<ScratchBank, mpsc::UnboundedSender<Vec<u8>>>>,
    rssi: Mutex<Option<i16>>,
    fail_writes: AtomicBool,
    fail_negotiation: AtomicBool,
    disconnected: Arc<AtomicBool>,
    disconnect_delay: Duration,
}

impl FakeLink {
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, Arc::new(AtomicBool::new(false)), Duration::ZERO)
    }

    fn build(id: &str, disconnected: Arc<AtomicBool>, disconnect_delay: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded();
        Arc::new(FakeLink {
            id: id.to_string(),
            writes: Mutex::new(Vec::new()),
            serial_tx: Mutex::new(Some(tx)),
            serial_rx: Mutex::new(Some(rx)),
            scratch: Mutex::new(HashMap::new()),
            rssi: Mutex::new(Some(-60)),
            fail_writes: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
            disconnected,
            disconnect_delay,
        })
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn notify_serial(&self, packet: Vec<u8>) {
        if let Some(tx) = self.serial_tx.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(packet);
        }
    }

    pub fn notify_scratch(&self, bank: ScratchBank, data: Vec<u8>) {
        if let Some(tx) = self.scratch.lock().unwrap().get(&bank) {
            let _ = tx.unbounded_send(data);
        }
    }

    /// Simulate the device going out of range.
    pub fn drop_serial(&self) {
        self.serial_tx.lock().unwrap().take();
    }

    pub fn set_rssi(&self, rssi: Option<i16>) {
        *self.rssi.lock().unwrap() = rssi;
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for FakeLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn negotiate(&self) -> Result<(), BleError> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(BleError::CharacteristicNotFound(SERIAL_CHARACTERISTIC));
        }
        Ok(())
    }

    async fn write_serial(&self, packet: &[u8]) -> Result<(), BleError> {
        if self.is_disconnected() {
            return Err(BleError::Disconnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(not_connected());
        }
        self.writes.lock().unwrap().push(packet.to_vec());
        Ok(())
    }

    async fn serial_notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        let rx = self.serial_rx.lock().unwrap().take();
        rx.map(|rx| rx.boxed()).ok_or(BleError::NotNegotiated)
    }

    async fn scratch_notifications(
        &self,
        bank: ScratchBank,
    ) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        let (tx, rx) = mpsc::unbounded();
        self.scratch.lock().unwrap().insert(bank, tx);
        Ok(rx.boxed())
    }

    async fn rssi(&self) -> Result<i16, BleError> {
        self.rssi.lock().unwrap().ok_or(BleError::RssiUnavailable)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if !self.disconnect_delay.is_zero() {
            tokio::time::sleep(self.disconnect_delay).await;
        }
        self.disconnected.store(true, Ordering::SeqCst);
        self.drop_serial();
        Ok(())
    }
}
