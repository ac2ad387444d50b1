//! Domain layer: robot vocabulary, profiles, servo tables and the per-robot
//! state machine. Nothing in here performs I/O.

pub mod command;
pub mod error;
pub mod intent;
pub mod models;
pub mod profile;
pub mod robot_state;
pub mod servo_map;
pub mod settings;
