//! Cycling head-unit core.
//!
//! ANT+ sensor decoding, GPS validation, a fixed-rate integration loop that
//! fuses everything into one sample per tick, and a session logger that
//! persists each tick and can rebuild its statistics after a crash.

pub mod ant;
pub mod config;
pub mod error;
pub mod export;
pub mod gps;
pub mod integrate;
pub mod runtime;
pub mod session;
pub mod store;
pub mod types;

pub use config::Settings;
pub use error::{AntError, ConfigError, ExportError, LogStoreError, RuntimeError, SessionError};
pub use integrate::{IntegratedSample, Integrator};
pub use runtime::{Runtime, RuntimeHandle, Sources};
pub use session::{LogRow, ResetOutcome, ResumeOutcome, SessionLogger};
pub use store::{SensorMessage, SensorStore};
