//! Value types and line parsers shared by the kegbot daemon.
//!
//! Nothing in here performs IO; the daemon feeds raw serial lines and social
//! message text in and gets typed readings and commands back.

pub mod command;
pub mod tap;
pub mod telemetry;

pub use command::{CommandParser, ParseOutcome, ReplacementCommand, TAPPED_ON_FORMAT};
pub use tap::{Tap, TapIndex, TapStatus, TapTable, VolumeAnomaly};
pub use telemetry::{TelemetryDecoder, TelemetryError, TelemetryReading};
