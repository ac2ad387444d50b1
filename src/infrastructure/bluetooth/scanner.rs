//! BLE Scanner Module
//!
//! Time-boxed discovery of Robosen robots. Advertisements are matched against
//! the profile registry by name prefix; anything else is ignored.

use crate::domain::error::TransportError;
use crate::domain::models::{BleAddress, DiscoveredRobot};
use crate::domain::profile::{GattProfile, ProfileRegistry};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, AdvertisementStream, BleTransport,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct Scanner {
    transport: Arc<dyn BleTransport>,
    profiles: Arc<ProfileRegistry>,
    gatt: GattProfile,
}

impl Scanner {
    pub fn new(transport: Arc<dyn BleTransport>, profiles: Arc<ProfileRegistry>) -> Self {
        let gatt = profiles
            .iter()
            .next()
            .map(|p| p.gatt.clone())
            .unwrap_or_default();
        Self {
            transport,
            profiles,
            gatt,
        }
    }

    /// Start a scan that ends after `window`.
    pub async fn scan(&self, window: Duration) -> Result<ScanSession, TransportError> {
        info!(
            "Starting BLE scan for {:?} ({} ms)",
            self.profiles.name_prefixes(),
            window.as_millis()
        );
        let stream = self.transport.start_scan(&self.gatt).await?;
        Ok(ScanSession {
            stream,
            profiles: self.profiles.clone(),
            deadline: Instant::now() + window,
            seen: HashSet::new(),
        })
    }
}

pub struct ScanSession {
    stream: AdvertisementStream,
    profiles: Arc<ProfileRegistry>,
    deadline: Instant,
    seen: HashSet<BleAddress>,
}

impl ScanSession {
    /// Next newly discovered robot, or `None` once the window has closed.
    pub async fn next(&mut self) -> Option<DiscoveredRobot> {
        loop {
            let advertisement = tokio::time::timeout_at(self.deadline, self.stream.next())
                .await
                .ok()??;
            if let Some(robot) = self.accept(advertisement) {
                return Some(robot);
            }
        }
    }

    fn accept(&mut self, advertisement: Advertisement) -> Option<DiscoveredRobot> {
        if self.seen.contains(&advertisement.address) {
            return None;
        }
        let Some(profile) = self.profiles.match_name(&advertisement.name) else {
            debug!(
                "Ignoring {} ('{}')",
                advertisement.address, advertisement.name
            );
            return None;
        };
        self.seen.insert(advertisement.address);

        info!(
            "Found {} '{}' at {} ({} dBm)",
            profile.display_name,
            advertisement.name,
            advertisement.address,
            advertisement.signal_strength
        );
        Some(DiscoveredRobot {
            address: advertisement.address,
            name: advertisement.name,
            platform: profile.platform,
            signal_strength: advertisement.signal_strength,
        })
    }

    pub fn found(&self) -> usize {
        self.seen.len()
    }
}
