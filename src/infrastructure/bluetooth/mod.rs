//! Bluetooth Module
//!
//! Provides BLE communication with Robosen robots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │      (per-robot writer / reader / poller tasks)          │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │
//! │           │  │            │  │          │
//! │ - name    │  │ - backoff  │  │ - frames │
//! │   filter  │  │ - retries  │  │ - codec  │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘
//!       └──────┬───────┘
//!              ▼
//!      ┌───────────────┐
//!      │ BleTransport  │  WinRT or simulated fleet
//!      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`frame`] - Frame layout, checksum and notification reassembly
//! - [`protocol`] - Opcodes, command encoding and event decoding
//! - [`transport`] - Transport and link traits
//! - [`scanner`] - Time-boxed robot discovery
//! - [`connection`] - Connection attempts with backoff
//! - [`service`] - Connection manager coordinating all links
//! - [`simulated`] - In-process robot fleet

pub mod connection;
pub mod frame;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use service::ConnectionManager;
