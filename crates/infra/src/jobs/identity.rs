//! Job identity.
//!
//! Deduplicated and periodic jobs get deterministic ids, so enqueueing the
//! same logical job twice lands on the same queue member and payload key and
//! the second write is a no-op.

use serde_json::Value;
use sha2::{Digest, Sha256};

use depot_core::{JobId, JobType};

use super::types::Kwargs;

/// Hex SHA-256 of the canonical JSON encoding of `[args, kwargs]`.
///
/// Object keys are sorted at every depth, so two argument sets that differ
/// only in key order share a digest.
pub fn args_digest(args: &[Value], kwargs: &Kwargs) -> String {
    let canonical = canonicalize(&Value::Array(vec![
        Value::Array(args.to_vec()),
        Value::Object(kwargs.clone()),
    ]));
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

/// Derive the id of a job.
///
/// 1. `dedupe_key` → `dedupe:<key>:<task>:<digest>`
/// 2. `job_type`   → `<job_type>:<task>:<digest>`
/// 3. otherwise a random UUIDv7
pub fn derive_job_id(
    task: &str,
    args: &[Value],
    kwargs: &Kwargs,
    job_type: Option<JobType>,
    dedupe_key: Option<&str>,
) -> JobId {
    match (dedupe_key, job_type) {
        (Some(key), _) => JobId::from_string(format!("dedupe:{key}:{task}:{}", args_digest(args, kwargs))),
        (None, Some(job_type)) => JobId::from_string(format!(
            "{}:{task}:{}",
            job_type.as_str(),
            args_digest(args, kwargs)
        )),
        (None, None) => JobId::random(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map,
            _ => Kwargs::new(),
        }
    }

    #[test]
    fn dedupe_key_wins_over_job_type() {
        let id = derive_job_id("orders.sync", &[json!(7)], &Kwargs::new(), Some(JobType::Cron), Some("order-7"));
        assert!(id.as_str().starts_with("dedupe:order-7:orders.sync:"));
    }

    #[test]
    fn periodic_ids_are_prefixed_with_job_type() {
        let id = derive_job_id("reports.daily", &[], &Kwargs::new(), Some(JobType::Interval), None);
        assert!(id.as_str().starts_with("interval:reports.daily:"));
    }

    #[test]
    fn ad_hoc_jobs_get_fresh_ids() {
        let a = derive_job_id("mail.send", &[], &Kwargs::new(), None, None);
        let b = derive_job_id("mail.send", &[], &Kwargs::new(), None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn key_order_does_not_change_the_digest() {
        let a = kwargs(json!({"sku": "A-1", "meta": {"x": 1, "y": 2}}));
        let mut b = Kwargs::new();
        b.insert("meta".into(), json!({"y": 2, "x": 1}));
        b.insert("sku".into(), json!("A-1"));
        assert_eq!(args_digest(&[], &a), args_digest(&[], &b));
    }

    #[test]
    fn args_and_kwargs_do_not_collide() {
        // Concatenating string forms would make these equal.
        let a = args_digest(&[json!("a:b")], &Kwargs::new());
        let b = args_digest(&[json!("a"), json!("b")], &Kwargs::new());
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn identical_inputs_share_an_id(key in "[a-z0-9-]{1,12}", n in any::<i64>(), s in ".{0,16}") {
            let args = vec![json!(n), json!(s)];
            let a = derive_job_id("t", &args, &Kwargs::new(), None, Some(&key));
            let b = derive_job_id("t", &args, &Kwargs::new(), None, Some(&key));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn different_args_get_different_ids(x in any::<i64>(), y in any::<i64>()) {
            prop_assume!(x != y);
            let a = derive_job_id("t", &[json!(x)], &Kwargs::new(), Some(JobType::Cron), None);
            let b = derive_job_id("t", &[json!(y)], &Kwargs::new(), Some(JobType::Cron), None);
            prop_assert_ne!(a, b);
        }
    }
}
