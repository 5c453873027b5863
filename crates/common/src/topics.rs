/// Root of the platform's reserved topic namespace (shadows, jobs, identity)
pub const RESERVED_ROOT: &str = "$aws";

/// Every topic a single device publishes to or subscribes on.
///
/// Device originated data lives under `<thing>/...`; shadow and job
/// operations live under the reserved root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    thing_name: String,
}

impl DeviceTopics {
    pub fn new(thing_name: impl Into<String>) -> Self {
        Self {
            thing_name: thing_name.into(),
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    pub fn soil_moisture(&self) -> String {
        format!("{}/sensordata/soil_moisture", self.thing_name)
    }

    pub fn rotation_complete(&self) -> String {
        format!("{}/certificate/rotation/complete", self.thing_name)
    }

    pub fn custom_certificate_initiate(&self) -> String {
        format!("{}/customCa/certificate/create/initiate", self.thing_name)
    }

    pub fn custom_certificate_complete(&self) -> String {
        format!("{}/customCa/certificate/create/complete", self.thing_name)
    }

    pub fn shadow_update(&self) -> String {
        format!("{}/shadow/update", self.thing_root())
    }

    pub fn shadow_delta(&self) -> String {
        format!("{}/shadow/update/delta", self.thing_root())
    }

    pub fn shadow_get(&self) -> String {
        format!("{}/shadow/get", self.thing_root())
    }

    pub fn shadow_get_accepted(&self) -> String {
        format!("{}/shadow/get/accepted", self.thing_root())
    }

    pub fn jobs_notify_next(&self) -> String {
        format!("{}/jobs/notify-next", self.thing_root())
    }

    pub fn jobs_start_next(&self) -> String {
        format!("{}/jobs/start-next", self.thing_root())
    }

    pub fn jobs_start_next_accepted(&self) -> String {
        format!("{}/jobs/start-next/accepted", self.thing_root())
    }

    pub fn jobs_start_next_rejected(&self) -> String {
        format!("{}/jobs/start-next/rejected", self.thing_root())
    }

    pub fn job_update(&self, job_id: &str) -> String {
        format!("{}/jobs/{}/update", self.thing_root(), job_id)
    }

    /// Filter matching update acceptances for any job id
    pub fn job_update_accepted_filter(&self) -> String {
        self.job_update("+") + "/accepted"
    }

    /// Filter matching update rejections for any job id
    pub fn job_update_rejected_filter(&self) -> String {
        self.job_update("+") + "/rejected"
    }

    fn thing_root(&self) -> String {
        format!("{}/things/{}", RESERVED_ROOT, self.thing_name)
    }
}

/// Topics of the identity bootstrap exchange. Not device scoped: the claim
/// session has no thing name yet.
pub struct ProvisioningTopics;

impl ProvisioningTopics {
    pub fn create_keys() -> String {
        format!("{}/certificates/create/json", RESERVED_ROOT)
    }

    pub fn create_keys_accepted() -> String {
        Self::create_keys() + "/accepted"
    }

    pub fn create_keys_rejected() -> String {
        Self::create_keys() + "/rejected"
    }

    pub fn register_thing(template_name: &str) -> String {
        format!(
            "{}/provisioning-templates/{}/provision/json",
            RESERVED_ROOT, template_name
        )
    }

    pub fn register_thing_accepted(template_name: &str) -> String {
        Self::register_thing(template_name) + "/accepted"
    }

    pub fn register_thing_rejected(template_name: &str) -> String {
        Self::register_thing(template_name) + "/rejected"
    }
}

/// Check whether a concrete topic matches an MQTT subscription filter.
///
/// Supports the single level `+` wildcard and a trailing multi level `#`.
///
/// # Examples
/// ```
/// use common::topics::topic_matches;
///
/// assert!(topic_matches("$aws/things/t1/jobs/+/update/accepted", "$aws/things/t1/jobs/job-7/update/accepted"));
/// assert!(!topic_matches("t1/sensordata/+", "t1/sensordata/soil/raw"));
/// ```
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Extract the job id from `$aws/things/<thing>/jobs/<job_id>/update/...`
pub fn job_id_from_update_topic(topic: &str) -> Option<&str> {
    let levels: Vec<&str> = topic.split('/').collect();
    match levels.as_slice() {
        [root, "things", _, "jobs", job_id, "update", ..]
            if *root == RESERVED_ROOT && !job_id.is_empty() =>
        {
            Some(job_id)
        }
        _ => None,
    }
}

/// Extract the thing name from a device originated topic (`<thing>/...`)
pub fn thing_name_from_topic(topic: &str) -> Option<&str> {
    let (thing, rest) = topic.split_once('/')?;
    if thing.is_empty() || thing.starts_with('$') || rest.is_empty() {
        return None;
    }
    Some(thing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_topics() {
        let topics = DeviceTopics::new("sprinkler-01");

        assert_eq!(topics.soil_moisture(), "sprinkler-01/sensordata/soil_moisture");
        assert_eq!(
            topics.shadow_update(),
            "$aws/things/sprinkler-01/shadow/update"
        );
        assert_eq!(
            topics.shadow_get_accepted(),
            "$aws/things/sprinkler-01/shadow/get/accepted"
        );
        assert_eq!(
            topics.custom_certificate_complete(),
            "sprinkler-01/customCa/certificate/create/complete"
        );
        assert_eq!(
            topics.job_update("job-1"),
            "$aws/things/sprinkler-01/jobs/job-1/update"
        );
        assert_eq!(
            topics.job_update_accepted_filter(),
            "$aws/things/sprinkler-01/jobs/+/update/accepted"
        );
    }

    #[test]
    fn test_provisioning_topics() {
        assert_eq!(
            ProvisioningTopics::create_keys_accepted(),
            "$aws/certificates/create/json/accepted"
        );
        assert_eq!(
            ProvisioningTopics::register_thing_rejected("SprinklerTemplate"),
            "$aws/provisioning-templates/SprinklerTemplate/provision/json/rejected"
        );
    }

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn test_topic_matches_single_level_wildcard() {
        let filter = DeviceTopics::new("t1").job_update_accepted_filter();
        assert!(topic_matches(&filter, "$aws/things/t1/jobs/abc/update/accepted"));
        assert!(!topic_matches(&filter, "$aws/things/t1/jobs/abc/update/rejected"));
        assert!(!topic_matches(&filter, "$aws/things/t2/jobs/abc/update/accepted"));
    }

    #[test]
    fn test_topic_matches_multi_level_wildcard() {
        assert!(topic_matches("t1/#", "t1/sensordata/soil_moisture"));
        assert!(!topic_matches("t1/#", "t2/sensordata"));
    }

    #[test]
    fn test_job_id_from_update_topic() {
        assert_eq!(
            job_id_from_update_topic("$aws/things/t1/jobs/job-42/update/accepted"),
            Some("job-42")
        );
        assert_eq!(job_id_from_update_topic("$aws/things/t1/jobs/notify-next"), None);
        assert_eq!(job_id_from_update_topic("t1/sensordata/soil_moisture"), None);
    }

    #[test]
    fn test_thing_name_from_topic() {
        assert_eq!(
            thing_name_from_topic("sprinkler-01/certificate/rotation/complete"),
            Some("sprinkler-01")
        );
        assert_eq!(thing_name_from_topic("$aws/things/t1/shadow/get"), None);
        assert_eq!(thing_name_from_topic("no-separator"), None);
    }
}
