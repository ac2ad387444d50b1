//! Application layer: the engine task, the pure dispatch core and the
//! per-robot timers it schedules.

pub mod dispatcher;
pub mod engine;
pub mod scheduler;

pub use engine::Engine;
