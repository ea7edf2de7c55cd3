//! The device handle.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::color::Rgb;
use crate::error::BleError;
use crate::protocol::{self, Assembler, Command, ScratchBank, Telemetry};
use crate::transport::Link;

const TELEMETRY_CAPACITY: usize = 16;

/// A connected, negotiated Bean. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct Bean {
    inner: Arc<Inner>,
}

struct Inner {
    link: Arc<dyn Link>,
    sequence: AtomicU8,
    telemetry: broadcast::Sender<Telemetry>,
    disconnected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Bean {
    /// Subscribe to the serial characteristic of a negotiated link.
    ///
    /// `on_lost` runs once the notification stream ends, i.e. when the
    /// device goes away.
    pub async fn attach<F>(link: Arc<dyn Link>, on_lost: F) -> Result<Self, BleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut notifications = link.serial_notifications().await?;
        let (telemetry, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let sender = telemetry.clone();
        let id = link.id().to_string();
        let disconnected = Arc::new(AtomicBool::new(false));
        let ended = disconnected.clone();

        let reader = tokio::spawn(async move {
            let mut assembler = Assembler::default();
            while let Some(packet) = notifications.next().await {
                let Some(frame) = assembler.push(&packet) else {
                    continue;
                };
                if !frame.valid {
                    warn!("{}: dropping message {:#06x} with bad CRC", id, frame.command);
                    continue;
                }
                match Telemetry::decode(&frame) {
                    Some(reading) => {
                        // No receivers just means no stream is enabled.
                        let _ = sender.send(reading);
                    }
                    None => debug!("{}: unhandled message {:#06x}", id, frame.command),
                }
            }
            info!("{}: serial notifications ended", id);
            ended.store(true, Ordering::SeqCst);
            on_lost();
        });

        Ok(Bean {
            inner: Arc::new(Inner {
                link,
                sequence: AtomicU8::new(0),
                telemetry,
                disconnected,
                reader,
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.inner.link.id()
    }

    pub async fn set_color(&self, rgb: Rgb) -> Result<(), BleError> {
        debug!("{}: set color {}", self.id(), rgb);
        self.send(Command::LedWriteAll, &rgb.to_bytes()).await
    }

    /// Ask for an accelerometer reading; it arrives on [`Bean::telemetry`].
    pub async fn request_accel(&self) -> Result<(), BleError> {
        self.send(Command::AccelRead, &[]).await
    }

    /// Ask for a temperature reading; it arrives on [`Bean::telemetry`].
    pub async fn request_temp(&self) -> Result<(), BleError> {
        self.send(Command::TempRead, &[]).await
    }

    pub fn telemetry(&self) -> broadcast::Receiver<Telemetry> {
        self.inner.telemetry.subscribe()
    }

    pub async fn rssi(&self) -> Result<i16, BleError> {
        self.inner.link.rssi().await
    }

    /// Values notified on a scratch characteristic. Malformed payloads are
    /// skipped.
    pub async fn scratch(&self, bank: ScratchBank) -> Result<BoxStream<'static, i32>, BleError> {
        let id = self.id().to_string();
        let notifications = self.inner.link.scratch_notifications(bank).await?;
        Ok(notifications
            .filter_map(move |data| {
                let value = protocol::decode_scratch(&data);
                if value.is_none() {
                    warn!("{}: {} payload too short: {:?}", id, bank, data);
                }
                futures::future::ready(value)
            })
            .boxed())
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        info!("{}: disconnecting", self.id());
        self.inner.disconnected.store(true, Ordering::SeqCst);
        self.inner.link.disconnect().await
    }

    #[cfg(test)]
    pub fn same(&self, other: &Bean) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn send(&self, command: Command, payload: &[u8]) -> Result<(), BleError> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        for packet in protocol::encode(sequence, command, payload) {
            self.inner.link.write_serial(&packet).await?;
        }
        Ok(())
    }
}
