//! Fleet side of the certificate lifecycle.
//!
//! Services here react to device and audit events and drive the device
//! registry through the traits in [`registry`]; the cloud SDK bindings
//! implement those traits elsewhere.

pub mod certificate_authority;
pub mod cleanup;
pub mod error;
pub mod expiry;
pub mod firmware_version;
pub mod pre_provisioning;
pub mod registry;

pub use certificate_authority::*;
pub use cleanup::*;
pub use error::{LifecycleError, LifecycleResult};
pub use expiry::*;
pub use firmware_version::*;
pub use pre_provisioning::*;
pub use registry::{
    AuditRegistry, CertificateDescription, CertificateRegistry, DevicePublisher,
    OtaUpdateRegistry, RegisteredCertificate, ThingRegistry,
};
