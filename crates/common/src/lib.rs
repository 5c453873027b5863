pub mod messages;
pub mod telemetry;
pub mod topics;
