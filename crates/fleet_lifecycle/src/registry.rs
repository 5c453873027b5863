use crate::error::LifecycleResult;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Registry view of one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDescription {
    pub certificate_id: String,
    pub certificate_arn: String,
    pub certificate_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCertificate {
    pub certificate_id: String,
    pub certificate_arn: String,
}

/// Certificate and principal operations of the device registry.
/// The cloud SDK layer implements this trait.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CertificateRegistry: Send + Sync {
    /// Principal ARNs attached to a thing
    async fn list_thing_principals(&self, thing_name: &str) -> LifecycleResult<Vec<String>>;

    async fn detach_thing_principal(&self, thing_name: &str, principal: &str)
        -> LifecycleResult<()>;

    async fn attach_thing_principal(&self, thing_name: &str, principal: &str)
        -> LifecycleResult<()>;

    async fn revoke_certificate(&self, certificate_id: &str) -> LifecycleResult<()>;

    /// Force delete, even while still attached
    async fn delete_certificate(&self, certificate_id: &str) -> LifecycleResult<()>;

    async fn describe_certificate(
        &self,
        certificate_id: &str,
    ) -> LifecycleResult<CertificateDescription>;

    /// Things the principal is attached to
    async fn list_principal_things(&self, principal: &str) -> LifecycleResult<Vec<String>>;

    /// Register a certificate signed by a registered CA and activate it
    async fn register_certificate(
        &self,
        certificate_pem: &str,
        ca_certificate_pem: &str,
    ) -> LifecycleResult<RegisteredCertificate>;
}

/// Thing groups and attributes
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ThingRegistry: Send + Sync {
    async fn add_thing_to_group(&self, group_name: &str, thing_name: &str) -> LifecycleResult<()>;

    async fn remove_thing_from_group(&self, group_name: &str, thing_name: &str)
        -> LifecycleResult<()>;

    /// Merge attributes into the thing's existing ones
    async fn merge_thing_attributes(
        &self,
        thing_name: &str,
        attributes: BTreeMap<String, String>,
    ) -> LifecycleResult<()>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AuditRegistry: Send + Sync {
    /// Ids of the non-compliant device certificates one check found
    async fn list_finding_certificate_ids(
        &self,
        task_id: &str,
        check_name: &str,
    ) -> LifecycleResult<Vec<String>>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OtaUpdateRegistry: Send + Sync {
    /// Object keys of the files an OTA update ships, in order
    async fn update_file_keys(&self, ota_update_id: &str) -> LifecycleResult<Vec<String>>;
}

/// Publishes to device topics through the broker's data plane
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DevicePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> LifecycleResult<()>;
}

/// `arn:aws:iot:<region>:<account>:cert/<id>`
pub fn certificate_arn(region: &str, account_id: &str, certificate_id: &str) -> String {
    format!("arn:aws:iot:{}:{}:cert/{}", region, account_id, certificate_id)
}

/// Resource id after the first `/` of an ARN
pub fn resource_id_from_arn(arn: &str) -> Option<&str> {
    arn.split('/').nth(1).filter(|id| !id.is_empty())
}
