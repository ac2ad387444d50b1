//! WinRT BLE backend
//!
//! Discovery uses an active advertisement watcher. Connecting follows the
//! steps Windows needs for unpaired "just works" peripherals:
//!
//! 1. Resolve the device from its address
//! 2. Hold a `GattSession` with `MaintainConnection` set
//! 3. Locate the service and the write/notify characteristics
//! 4. Subscribe to value changes and connection status
//! 5. Enable notifications, retrying while the pairing dialog is up

use crate::domain::error::TransportError;
use crate::domain::models::BleAddress;
use crate::domain::profile::GattProfile;
use crate::infrastructure::bluetooth::transport::{
    Advertisement, AdvertisementStream, BleLink, BleTransport, EstablishedLink, LinkEvent,
    ScanHandle,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use windows::core::{Ref, GUID};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

const NOTIFY_ATTEMPTS: u32 = 3;

/// Parse a UUID string into a WinRT GUID
pub fn parse_uuid(uuid_str: &str) -> Result<GUID, TransportError> {
    let hex = uuid_str.replace('-', "");
    let invalid = || TransportError::Gatt(format!("invalid UUID '{uuid_str}'"));

    if hex.len() != 32 || !hex.is_ascii() {
        return Err(invalid());
    }

    let d1 = u32::from_str_radix(&hex[0..8], 16).map_err(|_| invalid())?;
    let d2 = u16::from_str_radix(&hex[8..12], 16).map_err(|_| invalid())?;
    let d3 = u16::from_str_radix(&hex[12..16], 16).map_err(|_| invalid())?;

    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }

    Ok(GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}

fn gatt_error(e: windows::core::Error) -> TransportError {
    TransportError::Gatt(e.to_string())
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; buffer.Length()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

struct WatcherHandle(BluetoothLEAdvertisementWatcher);

impl ScanHandle for WatcherHandle {
    fn stop(&self) {
        info!("Stopping BLE scan...");
        if let Err(e) = self.0.Stop() {
            warn!("Failed to stop advertisement watcher: {}", e);
        }
    }
}

#[derive(Debug, Default)]
pub struct WinRtTransport;

impl WinRtTransport {
    pub fn new() -> Self {
        Self
    }

    async fn open_device(&self, address: BleAddress) -> Result<BluetoothLEDevice, TransportError> {
        let unreachable = |e: windows::core::Error| TransportError::Unreachable {
            address,
            reason: e.to_string(),
        };
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address.0)
            .map_err(unreachable)?
            .await
            .map_err(unreachable)?;
        info!("Device resolved: {:?}", device.Name().map(|n| n.to_string()));
        Ok(device)
    }

    async fn open_session(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    async fn characteristics(
        device: &BluetoothLEDevice,
        gatt: &GattProfile,
    ) -> Result<(GattCharacteristic, GattCharacteristic), TransportError> {
        let service_uuid = parse_uuid(&gatt.service_uuid)?;
        let write_uuid = parse_uuid(&gatt.write_uuid)?;
        let notify_uuid = parse_uuid(&gatt.notify_uuid)?;

        let services_result = device
            .GetGattServicesForUuidAsync(service_uuid)
            .map_err(gatt_error)?
            .await
            .map_err(gatt_error)?;
        let status = services_result.Status().map_err(gatt_error)?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get GATT services: {:?}", status);
            return Err(TransportError::Gatt(format!(
                "service lookup returned {status:?}"
            )));
        }

        let services = services_result.Services().map_err(gatt_error)?;
        if services.Size().map_err(gatt_error)? == 0 {
            return Err(TransportError::Gatt(format!(
                "service {} not found",
                gatt.service_uuid
            )));
        }
        let service = services.GetAt(0).map_err(gatt_error)?;

        let access_status = service
            .RequestAccessAsync()
            .map_err(gatt_error)?
            .await
            .map_err(gatt_error)?;
        info!("Service access status: {:?}", access_status);

        let chars_result = service
            .GetCharacteristicsAsync()
            .map_err(gatt_error)?
            .await
            .map_err(gatt_error)?;
        if chars_result.Status().map_err(gatt_error)? != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(
                "failed to get characteristics".to_string(),
            ));
        }

        let characteristics = chars_result.Characteristics().map_err(gatt_error)?;
        let mut write_char = None;
        let mut notify_char = None;
        for i in 0..characteristics.Size().map_err(gatt_error)? {
            let c = characteristics.GetAt(i).map_err(gatt_error)?;
            let uuid = c.Uuid().map_err(gatt_error)?;
            if uuid == write_uuid {
                write_char = Some(c.clone());
            }
            if uuid == notify_uuid {
                notify_char = Some(c);
            }
        }

        let write = write_char
            .ok_or_else(|| TransportError::Gatt("write characteristic not found".to_string()))?;
        let notify = notify_char
            .ok_or_else(|| TransportError::Gatt("notify characteristic not found".to_string()))?;
        Ok((write, notify))
    }

    async fn enable_notifications(notify: &GattCharacteristic) -> Result<(), TransportError> {
        for attempt in 1..=NOTIFY_ATTEMPTS {
            let result = notify
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                )
                .map_err(gatt_error)?
                .await;

            match result {
                Ok(GattCommunicationStatus::Success) => {
                    info!("Notifications enabled");
                    return Ok(());
                }
                Ok(status) => {
                    warn!("Notification subscription returned status: {:?}", status);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    let error_str = format!("{:?}", e);
                    warn!(
                        "Notification subscription attempt {} failed: {}",
                        attempt, error_str
                    );
                    // 0x800704C7: the user has not accepted the pairing dialog yet
                    if error_str.contains("800704C7") {
                        warn!("Please accept the pairing dialog when it appears");
                    }
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                }
            }
        }

        error!(
            "Failed to enable notifications after {} attempts",
            NOTIFY_ATTEMPTS
        );
        Err(TransportError::Gatt(
            "failed to enable notifications".to_string(),
        ))
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn start_scan(&self, _gatt: &GattProfile) -> Result<AdvertisementStream, TransportError> {
        let scan_error = |e: windows::core::Error| TransportError::Scan(e.to_string());
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(scan_error)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(scan_error)?;

        // Robosen robots do not advertise the service UUID, so filtering
        // happens on the name in the scanner.
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = TypedEventHandler::new(
            move |_: Ref<BluetoothLEAdvertisementWatcher>,
                  args: Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let advertisement = Advertisement {
                        address: BleAddress(args.BluetoothAddress()?),
                        name: args.Advertisement()?.LocalName()?.to_string(),
                        signal_strength: args.RawSignalStrengthInDBm()?,
                    };
                    let _ = tx.send(advertisement);
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(scan_error)?;
        watcher.Start().map_err(scan_error)?;
        info!("BLE advertisement watcher started");

        Ok(AdvertisementStream::new(rx, Box::new(WatcherHandle(watcher))))
    }

    async fn connect(
        &self,
        address: BleAddress,
        gatt: &GattProfile,
    ) -> Result<EstablishedLink, TransportError> {
        let device = self.open_device(address).await?;

        let session = match Self::open_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let (write, notify) = Self::characteristics(&device, gatt).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let sender = tx.clone();
        let value_handler = TypedEventHandler::new(
            move |_: Ref<GattCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = sender.send(LinkEvent::Notification(bytes));
                }
                Ok(())
            },
        );
        let value_token = notify.ValueChanged(&value_handler).map_err(gatt_error)?;

        let sender = tx;
        let status_handler = TypedEventHandler::new(move |dev: Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                    let _ = sender.send(LinkEvent::Disconnected(
                        "device reported disconnected".to_string(),
                    ));
                }
            }
            Ok(())
        });
        let status_token = device
            .ConnectionStatusChanged(&status_handler)
            .map_err(gatt_error)?;

        Self::enable_notifications(&notify).await?;

        Ok(EstablishedLink {
            link: Arc::new(WinRtLink {
                device,
                session,
                write,
                notify,
                value_token,
                status_token,
            }),
            events: rx,
        })
    }
}

struct WinRtLink {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    write: GattCharacteristic,
    notify: GattCharacteristic,
    value_token: i64,
    status_token: i64,
}

#[async_trait]
impl BleLink for WinRtLink {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let write_error = |e: windows::core::Error| TransportError::Write(e.to_string());
        let writer = DataWriter::new().map_err(write_error)?;
        writer.WriteBytes(frame).map_err(write_error)?;
        let buffer = writer.DetachBuffer().map_err(write_error)?;

        let status = self
            .write
            .WriteValueAsync(&buffer)
            .map_err(write_error)?
            .await
            .map_err(write_error)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Write(format!("write returned {status:?}")));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.notify.RemoveValueChanged(self.value_token);
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        if let Some(session) = &self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
        info!("Disconnected from device");
    }
}
