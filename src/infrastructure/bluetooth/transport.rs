//! BLE transport seam
//!
//! The engine talks to radios through [`BleTransport`]. The WinRT backend and
//! the in-process simulated fleet both implement it.

use crate::domain::error::TransportError;
use crate::domain::models::BleAddress;
use crate::domain::profile::GattProfile;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One received advertisement, before any name filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: BleAddress,
    pub name: String,
    pub signal_strength: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw bytes from the notify characteristic, possibly a partial frame
    Notification(Vec<u8>),
    Disconnected(String),
}

/// Stops the radio-side scan when called
pub trait ScanHandle: Send + Sync {
    fn stop(&self);
}

/// Advertisements of a running scan. Dropping it stops the scan.
pub struct AdvertisementStream {
    advertisements: mpsc::UnboundedReceiver<Advertisement>,
    handle: Box<dyn ScanHandle>,
}

impl AdvertisementStream {
    pub fn new(
        advertisements: mpsc::UnboundedReceiver<Advertisement>,
        handle: Box<dyn ScanHandle>,
    ) -> Self {
        Self {
            advertisements,
            handle,
        }
    }

    pub async fn next(&mut self) -> Option<Advertisement> {
        self.advertisements.recv().await
    }
}

impl Drop for AdvertisementStream {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

/// A connected device with its notification subscription active
pub struct EstablishedLink {
    pub link: Arc<dyn BleLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl std::fmt::Debug for EstablishedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedLink").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn start_scan(&self, gatt: &GattProfile) -> Result<AdvertisementStream, TransportError>;

    /// Open the GATT session, locate the characteristics and subscribe to
    /// notifications.
    async fn connect(
        &self,
        address: BleAddress,
        gatt: &GattProfile,
    ) -> Result<EstablishedLink, TransportError>;
}

#[async_trait]
pub trait BleLink: Send + Sync {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self);
}
