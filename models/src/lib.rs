pub mod constants;
pub mod controller;
pub mod namespace;
pub mod node;
pub mod quarantine;
pub mod telemetry;
