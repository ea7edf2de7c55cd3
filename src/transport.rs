//! Seams between the session core and the BLE stack.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::debug;

use crate::error::{BleError, SessionError};
use crate::protocol::ScratchBank;

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub local_name: Option<String>,
}

impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.local_name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// Which device to look for. A device matches on identifier OR name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub id: Option<String>,
    pub local_name: Option<String>,
}

impl Target {
    pub fn new(id: &str, local_name: &str) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Target {
            id: non_empty(id),
            local_name: non_empty(local_name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.local_name.is_none()
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        let id_matches = self
            .id
            .as_deref()
            .is_some_and(|id| normalize_id(id) == normalize_id(&advertisement.id));
        let name_matches = self
            .local_name
            .as_deref()
            .is_some_and(|name| advertisement.local_name.as_deref() == Some(name));
        id_matches || name_matches
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.local_name) {
            (Some(id), Some(name)) => write!(f, "{} or {}", id, name),
            (Some(id), None) => f.write_str(id),
            (None, Some(name)) => f.write_str(name),
            (None, None) => f.write_str("<none>"),
        }
    }
}

// Addresses show up as "AA:BB:..", "aa-bb-.." or "aabb.." depending on the stack.
fn normalize_id(id: &str) -> String {
    id.chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A BLE central able to scan and connect.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Start scanning. Scanning stops when the returned stream is dropped.
    async fn scan(&self) -> Result<BoxStream<'static, Advertisement>, BleError>;

    /// Connect to a discovered device. The link still has to be negotiated.
    async fn connect(&self, advertisement: &Advertisement) -> Result<Arc<dyn Link>, BleError>;
}

/// A connection to one Bean.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Locate the serial and scratch characteristics.
    async fn negotiate(&self) -> Result<(), BleError>;

    async fn write_serial(&self, packet: &[u8]) -> Result<(), BleError>;

    /// Raw GATT packets notified on the serial characteristic. Ends when the
    /// device disconnects.
    async fn serial_notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, BleError>;

    async fn scratch_notifications(
        &self,
        bank: ScratchBank,
    ) -> Result<BoxStream<'static, Vec<u8>>, BleError>;

    async fn rssi(&self) -> Result<i16, BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;
}

/// Wait for the first advertisement matching `target`.
///
/// The stream is dropped on return, which stops the scan.
pub async fn discover(
    mut advertisements: BoxStream<'static, Advertisement>,
    target: &Target,
    timeout: Duration,
) -> Result<Advertisement, SessionError> {
    let search = async {
        while let Some(advertisement) = advertisements.next().await {
            if target.matches(&advertisement) {
                return Some(advertisement);
            }
            debug!("ignoring {}", advertisement);
        }
        None
    };
    match tokio::time::timeout(timeout, search).await {
        Ok(Some(advertisement)) => Ok(advertisement),
        Ok(None) | Err(_) => Err(SessionError::DeviceNotFound(target.to_string())),
    }
}
