pub mod admission;
pub mod api;
pub mod error;
pub mod telemetry;
