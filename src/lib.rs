//! snapship - ship database snapshot files to a bucket as they change.

pub mod config;
pub mod error;
pub mod logging;
pub mod shipping;
pub mod sink;

pub use config::{CliArgs, ShipConfig};
pub use error::{Result, ShipError};
pub use shipping::{ShipPipeline, ShipStats};
pub use sink::{open_sink, BlobSink};
