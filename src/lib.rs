//! Collects the telegrams tfrec prints for TFA/KlimaLogg sensors
//!
//! This library frames the line output of tfrec into telegrams, parses them
//! into observations keyed by `<name>.<hardware_id>.<packet_type>` and maps
//! those onto user defined fields, with deltas for cumulative counters.

pub mod models;
pub mod config;
pub mod process;
pub mod framer;
pub mod packets;
pub mod router;
pub mod deltas;
pub mod driver;
pub mod inspect;

// Re-export common types for easier access
pub use models::{FieldValue, Observation, OutputRecord, PacketFormat, TelegramBlock, UnitSystem};
pub use config::TfrcConfig;
pub use process::{LineSource, ProcManager};
pub use framer::TelegramFramer;
pub use packets::PacketFactory;
pub use deltas::DeltaEngine;
pub use driver::{DriverError, TfrcDriver};
