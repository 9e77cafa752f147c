use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{PowerMeterError, Result},
    transport::{EventSender, NotificationSource, Transport, TransportEvent},
    types::SessionConfig,
    POWER_SERVICE_UUID,
};

/// Primary service resolved on a connected peripheral
#[derive(Debug, Clone)]
pub struct BleService {
    peripheral: Peripheral,
    service: Service,
}

/// Characteristic resolved on a connected peripheral
#[derive(Debug, Clone)]
pub struct BleCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl BleCharacteristic {
    /// Characteristic UUID
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }
}

/// [`Transport`] backed by the platform BLE stack through `btleplug`
///
/// Devices are identified by their [`PeripheralId`]. Re-acquiring a device
/// looks the id up in the adapter's known peripherals without scanning;
/// stacks that forget peripherals between connections surface
/// [`PowerMeterError::DeviceUnavailable`] and reconnection counts it as a
/// failed attempt.
pub struct BtleplugTransport {
    adapter: Adapter,
    scan_timeout_ms: u64,
    connect_timeout_ms: u64,
    forwarders: Arc<Mutex<HashMap<PeripheralId, Vec<JoinHandle<()>>>>>,
}

impl BtleplugTransport {
    /// Create a transport on the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::Ble`] if the Bluetooth manager cannot be
    /// initialized, or [`PowerMeterError::DeviceUnavailable`] if no adapter
    /// is present.
    pub async fn new(config: &SessionConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PowerMeterError::DeviceUnavailable)?;

        Ok(Self {
            adapter,
            scan_timeout_ms: config.scan_timeout_ms,
            connect_timeout_ms: config.connect_timeout_ms,
            forwarders: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn track(&self, id: PeripheralId, task: JoinHandle<()>) {
        self.forwarders.lock().await.entry(id).or_default().push(task);
    }

    async fn stop_forwarders(&self, id: &PeripheralId) {
        if let Some(tasks) = self.forwarders.lock().await.remove(id) {
            for task in tasks {
                task.abort();
            }
        }
    }
}

/// Pick the candidate with the strongest signal
fn strongest<T>(candidates: impl IntoIterator<Item = (T, Option<i16>)>) -> Option<T> {
    candidates
        .into_iter()
        .max_by_key(|(_, rssi)| rssi.unwrap_or(i16::MIN))
        .map(|(candidate, _)| candidate)
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Device = PeripheralId;
    type Link = Peripheral;
    type Service = BleService;
    type Characteristic = BleCharacteristic;

    async fn request_device(&self, services: &[Uuid]) -> Result<PeripheralId> {
        info!("Starting scan for power meters...");

        let scan_filter = ScanFilter {
            services: services.to_vec(),
        };
        self.adapter.start_scan(scan_filter).await?;
        tokio::time::sleep(Duration::from_millis(self.scan_timeout_ms)).await;
        self.adapter.stop_scan().await?;

        let mut candidates = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if properties.services.contains(&POWER_SERVICE_UUID) {
                    debug!(
                        name = properties.local_name.as_deref().unwrap_or("unknown"),
                        rssi = ?properties.rssi,
                        "Found power meter"
                    );
                    candidates.push((peripheral.id(), properties.rssi));
                }
            }
        }

        info!("Scan completed. Found {} power meter(s)", candidates.len());
        strongest(candidates).ok_or(PowerMeterError::DeviceUnavailable)
    }

    async fn paired_device(&self, previous: &PeripheralId) -> Result<PeripheralId> {
        self.adapter
            .peripheral(previous)
            .await
            .map(|peripheral| peripheral.id())
            .map_err(|e| {
                debug!("Known peripheral lookup failed: {}", e);
                PowerMeterError::DeviceUnavailable
            })
    }

    async fn connect_link(&self, device: &PeripheralId) -> Result<Peripheral> {
        let peripheral = self
            .adapter
            .peripheral(device)
            .await
            .map_err(|_| PowerMeterError::DeviceUnavailable)?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            timeout(
                Duration::from_millis(self.connect_timeout_ms),
                peripheral.connect(),
            )
            .await
            .map_err(|_| PowerMeterError::Timeout {
                timeout_ms: self.connect_timeout_ms,
            })?
            .map_err(|e| PowerMeterError::LinkUnavailable(e.to_string()))?;
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| PowerMeterError::LinkUnavailable(e.to_string()))?;

        Ok(peripheral)
    }

    async fn get_service(&self, link: &Peripheral, service: Uuid) -> Result<BleService> {
        link.services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|found| BleService {
                peripheral: link.clone(),
                service: found,
            })
            .ok_or(PowerMeterError::ServiceNotFound(service))
    }

    async fn get_characteristic(
        &self,
        service: &BleService,
        characteristic: Uuid,
    ) -> Result<BleCharacteristic> {
        service
            .service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .map(|found| BleCharacteristic {
                peripheral: service.peripheral.clone(),
                characteristic: found.clone(),
            })
            .ok_or(PowerMeterError::CharacteristicNotFound(characteristic))
    }

    async fn subscribe(
        &self,
        characteristic: &BleCharacteristic,
        source: NotificationSource,
        events: EventSender,
    ) -> Result<()> {
        let peripheral = characteristic.peripheral.clone();
        let uuid = characteristic.uuid();

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| PowerMeterError::SubscribeFailed(e.to_string()))?;
        peripheral
            .subscribe(&characteristic.characteristic)
            .await
            .map_err(|e| PowerMeterError::SubscribeFailed(e.to_string()))?;

        let task = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                if data.uuid != uuid {
                    continue;
                }
                let event = TransportEvent::Notification {
                    source,
                    value: data.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!(?source, "Notification stream ended");
        });
        self.track(peripheral.id(), task).await;

        debug!(?source, %uuid, "Subscribed");
        Ok(())
    }

    async fn write_value(&self, characteristic: &BleCharacteristic, data: Bytes) -> Result<()> {
        debug!("Writing {:02X?}", &data[..]);
        characteristic
            .peripheral
            .write(&characteristic.characteristic, &data, WriteType::WithResponse)
            .await
            .map_err(|e| PowerMeterError::WriteFailed(e.to_string()))
    }

    async fn on_disconnected(&self, link: &Peripheral, events: EventSender) -> Result<()> {
        let id = link.id();
        let mut central_events = self.adapter.events().await?;

        let watched = id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == watched {
                        let _ = events.send(TransportEvent::Disconnected);
                        break;
                    }
                }
            }
        });
        self.track(id, task).await;
        Ok(())
    }

    async fn disconnect_link(&self, link: &Peripheral) -> Result<()> {
        self.stop_forwarders(&link.id()).await;

        if link.is_connected().await.unwrap_or(false) {
            if let Err(e) = link.disconnect().await {
                warn!("Failed to disconnect: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strongest_signal_wins() {
        let picked = strongest(vec![("far", Some(-90)), ("near", Some(-40)), ("mid", Some(-60))]);
        assert_eq!(picked, Some("near"));
    }

    #[test]
    fn test_missing_rssi_ranks_last() {
        assert_eq!(strongest(vec![("silent", None), ("weak", Some(-99))]), Some("weak"));
        assert_eq!(strongest(vec![("silent", None)]), Some("silent"));
        assert_eq!(strongest(Vec::<(&str, Option<i16>)>::new()), None);
    }
}
