//! Control engine for Robosen transforming robots over Bluetooth LE.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
