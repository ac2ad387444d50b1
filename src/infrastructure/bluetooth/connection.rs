//! BLE Connection Module
//!
//! Connection attempts with capped exponential backoff.

use crate::domain::error::{EngineError, TransportError};
use crate::domain::models::DiscoveredRobot;
use crate::domain::profile::GattProfile;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::transport::{BleTransport, EstablishedLink};
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for reconnect behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts per connect request, including the first
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_millis(8_000),
        }
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.reconnect_max_attempts.max(1),
            base: Duration::from_millis(settings.reconnect_base_delay_ms),
            cap: Duration::from_millis(settings.reconnect_max_delay_ms),
        }
    }

    /// Wait after failed attempt `attempt` (1-based): base * 2^(attempt - 1), capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// A single connection attempt.
pub async fn connect(
    transport: &dyn BleTransport,
    device: &DiscoveredRobot,
    gatt: &GattProfile,
) -> Result<EstablishedLink, TransportError> {
    info!("Connecting to {} ({})", device.name, device.address);
    transport.connect(device.address, gatt).await
}

/// Retry [`connect`] under `policy`. Returns the link and the attempt that succeeded.
pub async fn connect_with_backoff(
    transport: &dyn BleTransport,
    device: &DiscoveredRobot,
    gatt: &GattProfile,
    policy: BackoffPolicy,
    initial_delay: Duration,
) -> Result<(EstablishedLink, u32), EngineError> {
    if !initial_delay.is_zero() {
        tokio::time::sleep(initial_delay).await;
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect(transport, device, gatt).await {
            Ok(link) => {
                info!("Connected to {} on attempt {}", device.name, attempt);
                return Ok((link, attempt));
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    "Giving up on {} after {} attempt(s): {}",
                    device.name, attempt, e
                );
                return Err(EngineError::ConnectionFailed {
                    address: device.address,
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                warn!(
                    "Connection attempt {} to {} failed: {}. Retrying in {:?}",
                    attempt, device.name, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BleAddress, Platform};
    use crate::infrastructure::bluetooth::transport::{AdvertisementStream, BleLink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct NullLink;

    #[async_trait]
    impl BleLink for NullLink {
        async fn write(&self, _frame: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        async fn disconnect(&self) {}
    }

    /// Fails the first `failures` connects.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BleTransport for Flaky {
        async fn start_scan(
            &self,
            _gatt: &GattProfile,
        ) -> Result<AdvertisementStream, TransportError> {
            Err(TransportError::Scan("not scanning".to_string()))
        }

        async fn connect(
            &self,
            address: BleAddress,
            _gatt: &GattProfile,
        ) -> Result<EstablishedLink, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(TransportError::Unreachable {
                    address,
                    reason: format!("attempt {call}"),
                });
            }
            let (_tx, events) = mpsc::unbounded_channel();
            Ok(EstablishedLink {
                link: Arc::new(NullLink),
                events,
            })
        }
    }

    fn device() -> DiscoveredRobot {
        DiscoveredRobot {
            address: BleAddress(0xAB),
            name: "MEGAF-1".to_string(),
            platform: Platform::Megatron,
            signal_strength: -50,
        }
    }

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay(4), Duration::from_millis(4_000));
        assert_eq!(policy.delay(5), Duration::from_millis(8_000));
        assert_eq!(policy.delay(40), Duration::from_millis(8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connected() {
        let transport = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let start = tokio::time::Instant::now();
        let (_, attempts) = connect_with_backoff(
            &transport,
            &device(),
            &GattProfile::default(),
            BackoffPolicy::default(),
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let transport = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::default()
        };
        let err = connect_with_backoff(
            &transport,
            &device(),
            &GattProfile::default(),
            policy,
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();

        match err {
            EngineError::ConnectionFailed {
                address, attempts, ..
            } => {
                assert_eq!(address, BleAddress(0xAB));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }
}
