// Bluetooth Low Energy transport using bluer crate

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info};

use crate::error::BleError;
use crate::protocol::{ScratchBank, SCRATCH_SERVICE, SERIAL_CHARACTERISTIC, SERIAL_SERVICE};
use crate::transport::{Advertisement, Link, Radio};

pub struct BleAdapter {
    adapter: Adapter,
    name: String,
}

impl BleAdapter {
    /// Open the named adapter, or the default one.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, BleError> {
        let session = bluer::Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        let name = adapter.name().to_string();

        info!("Using Bluetooth adapter: {}", name);

        // Ensure adapter is powered on
        adapter.set_powered(true).await?;

        debug!("Adapter address: {}", adapter.address().await?);

        Ok(BleAdapter { adapter, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Radio for BleAdapter {
    async fn scan(&self) -> Result<BoxStream<'static, Advertisement>, BleError> {
        info!("Starting BLE device scan...");
        // Re-reports a device whenever its properties change, so a name
        // that arrives with a later scan response is still seen.
        let events = self.adapter.discover_devices_with_changes().await?;
        let adapter = self.adapter.clone();

        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    let AdapterEvent::DeviceAdded(address) = event else {
                        return None;
                    };
                    let device = adapter.device(address).ok()?;
                    let local_name = device.name().await.ok().flatten();
                    Some(Advertisement {
                        id: address.to_string(),
                        local_name,
                    })
                }
            })
            .boxed())
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<Arc<dyn Link>, BleError> {
        info!("Connecting to device: {}", advertisement);
        let address: Address = advertisement
            .id
            .parse()
            .map_err(|_| BleError::InvalidAddress(advertisement.id.clone()))?;
        let device = self.adapter.device(address)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }
        Ok(Arc::new(BleLink {
            id: advertisement.id.clone(),
            device,
            gatt: OnceLock::new(),
        }))
    }
}

struct Gatt {
    serial: Characteristic,
    scratch: Vec<(ScratchBank, Characteristic)>,
}

struct BleLink {
    id: String,
    device: Device,
    gatt: OnceLock<Gatt>,
}

impl BleLink {
    fn gatt(&self) -> Result<&Gatt, BleError> {
        self.gatt.get().ok_or(BleError::NotNegotiated)
    }
}

#[async_trait]
impl Link for BleLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn negotiate(&self) -> Result<(), BleError> {
        let mut serial = None;
        let mut scratch = Vec::new();

        for service in self.device.services().await? {
            let uuid = service.uuid().await?;
            if uuid != SERIAL_SERVICE && uuid != SCRATCH_SERVICE {
                continue;
            }
            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                if uuid == SERIAL_CHARACTERISTIC {
                    serial = Some(characteristic);
                } else if let Some(bank) = ScratchBank::from_uuid(uuid) {
                    scratch.push((bank, characteristic));
                }
            }
        }

        let serial = serial.ok_or(BleError::CharacteristicNotFound(SERIAL_CHARACTERISTIC))?;
        debug!("{}: serial transport found, {} scratch banks", self.id, scratch.len());
        // A second negotiation keeps the first set of characteristics.
        let _ = self.gatt.set(Gatt { serial, scratch });
        Ok(())
    }

    async fn write_serial(&self, packet: &[u8]) -> Result<(), BleError> {
        self.gatt()?.serial.write(packet).await?;
        Ok(())
    }

    async fn serial_notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        Ok(self.gatt()?.serial.notify().await?.boxed())
    }

    async fn scratch_notifications(
        &self,
        bank: ScratchBank,
    ) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        let characteristic = self
            .gatt()?
            .scratch
            .iter()
            .find(|(candidate, _)| *candidate == bank)
            .map(|(_, characteristic)| characteristic)
            .ok_or(BleError::CharacteristicNotFound(bank.uuid()))?;
        Ok(characteristic.notify().await?.boxed())
    }

    async fn rssi(&self) -> Result<i16, BleError> {
        self.device.rssi().await?.ok_or(BleError::RssiUnavailable)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.device.disconnect().await?;
        Ok(())
    }
}
