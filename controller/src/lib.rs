pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod reschedule;
pub mod settings;
pub mod statemachine;
pub mod telemetry;

pub use crate::controller::{run, Context};
pub use crate::lifecycle::QuarantineLifecycle;
pub use crate::reschedule::SelfRescheduler;
pub use crate::settings::ControllerSettings;
