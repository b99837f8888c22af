//! Public configuration and error-reporting types shared by the slicer
//! engine and the components that embed it.

pub mod config;
pub mod error;
pub mod termination;

pub use config::{
    BufferConfig, ConfigError, EngineConfig, InsertStrategy, JoinAlgorithmKind, JoinConfig,
    PreAggregation, TimeoutConfig, WatermarkConfig, WindowConfig,
};
pub use error::{DetailedError, ErrorResponse};
pub use termination::TerminationType;
