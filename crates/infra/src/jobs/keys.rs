//! Store key layout.
//!
//! ```text
//! <ns>:job_queue:<queue>            sorted set, member <ns>:job:<id>, score due_at
//! <ns>:job:payload:<id>             serialized JobPayload, TTL
//! <ns>:job_results:<status>         sorted set of job ids, score completion time
//! <ns>:job_result:<id>              serialized ResultEntry
//! <ns>:scheduler:lock               scheduler holder identity, TTL
//! <ns>:scheduler:last_run:<task>    unix seconds of the last periodic run
//! ```

use depot_core::{JobId, QueueName, ResultStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn queue(&self, queue: QueueName) -> String {
        format!("{}:job_queue:{}", self.namespace, queue.as_str())
    }

    /// Queue keys in consumption order, highest priority first.
    pub fn queues_by_priority(&self) -> Vec<String> {
        QueueName::PRIORITY.iter().map(|q| self.queue(*q)).collect()
    }

    pub fn queue_from_key(&self, key: &str) -> Option<QueueName> {
        key.strip_prefix(&self.namespace)?
            .strip_prefix(":job_queue:")?
            .parse()
            .ok()
    }

    pub fn job_member(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.namespace, job_id)
    }

    pub fn job_id_from_member(&self, member: &str) -> Option<JobId> {
        let id = member.strip_prefix(&self.namespace)?.strip_prefix(":job:")?;
        id.parse().ok()
    }

    pub fn payload(&self, job_id: &JobId) -> String {
        format!("{}:job:payload:{}", self.namespace, job_id)
    }

    pub fn results_index(&self, status: ResultStatus) -> String {
        format!("{}:job_results:{}", self.namespace, status.as_str())
    }

    pub fn result_detail(&self, job_id: &JobId) -> String {
        format!("{}:job_result:{}", self.namespace, job_id)
    }

    pub fn scheduler_lock(&self) -> String {
        format!("{}:scheduler:lock", self.namespace)
    }

    pub fn last_run(&self, task: &str) -> String {
        format!("{}:scheduler:last_run:{}", self.namespace, task)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("depot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_documented_shapes() {
        let keys = KeySpace::new("erp");
        let id = JobId::from_string("abc");

        assert_eq!(keys.queue(QueueName::Mail), "erp:job_queue:mail");
        assert_eq!(keys.job_member(&id), "erp:job:abc");
        assert_eq!(keys.payload(&id), "erp:job:payload:abc");
        assert_eq!(keys.results_index(ResultStatus::Failure), "erp:job_results:failure");
        assert_eq!(keys.result_detail(&id), "erp:job_result:abc");
        assert_eq!(keys.scheduler_lock(), "erp:scheduler:lock");
    }

    #[test]
    fn members_and_queue_keys_parse_back() {
        let keys = KeySpace::default();
        let id = JobId::from_string("dedupe:order-7:orders.sync:ff00");

        assert_eq!(keys.job_id_from_member(&keys.job_member(&id)), Some(id));
        assert_eq!(keys.queue_from_key("depot:job_queue:low"), Some(QueueName::Low));
        assert_eq!(keys.queue_from_key("other:job_queue:low"), None);
        assert_eq!(keys.job_id_from_member("depot:job:"), None);
    }

    #[test]
    fn priority_order_is_high_default_low_mail() {
        assert_eq!(
            KeySpace::default().queues_by_priority(),
            vec![
                "depot:job_queue:high",
                "depot:job_queue:default",
                "depot:job_queue:low",
                "depot:job_queue:mail",
            ]
        );
    }
}
