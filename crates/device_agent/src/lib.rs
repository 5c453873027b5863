pub mod agent;
pub mod error;
pub mod firmware;
pub mod identity;
pub mod jobs;
pub mod parameters;
pub mod provisioning;
pub mod rotation;
pub mod sensor;
pub mod shadow;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::*;
pub use error::*;
