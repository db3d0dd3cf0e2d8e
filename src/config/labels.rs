//! Container label parsing (spec.md §4.5, §4.6).
//!
//! Grounded directly on the teacher's per-prefix `Regex`-based label
//! grouping in `job.rs`, extended from exec-only to all five job kinds and
//! to JSON-array-valued multi fields.

use std::collections::HashMap;

use regex::Regex;

use crate::config::RawFields;
use crate::job::JobType;

pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// One job candidate discovered on a container, already name-scoped.
pub struct LabelJobCandidate {
    pub job_type: JobType,
    /// Fully scoped name: `<svc-or-container>.<jobname>`.
    pub name: String,
    pub fields: RawFields,
}

/// Whether `labels` opts this container into discovery under any of
/// `prefixes` (the "service enabled" required label, spec.md §4.5).
pub fn enabled_prefix<'a>(labels: &HashMap<String, String>, prefixes: &'a [String]) -> Option<&'a str> {
    prefixes
        .iter()
        .find(|p| labels.get(&format!("{}.enabled", p)).map(|v| v == "true").unwrap_or(false))
        .map(|p| p.as_str())
}

/// Parse every `<prefix>.job-<type>.<name>.<field>` label on one
/// container into job candidates, scoped per the compose-service naming
/// rule (spec.md §4.5, §8 scenario 6).
pub fn parse_container_labels(
    container_name: &str,
    labels: &HashMap<String, String>,
    prefix: &str,
) -> anyhow::Result<Vec<LabelJobCandidate>> {
    let scope = labels
        .get(COMPOSE_SERVICE_LABEL)
        .cloned()
        .unwrap_or_else(|| container_name.to_string());

    let re = Regex::new(&format!(
        r"^{}\.(job-[a-z-]+)\.([^.]+)\.(.+)$",
        regex::escape(prefix)
    ))?;

    // job_type -> jobname -> RawFields
    let mut grouped: HashMap<(JobType, String), RawFields> = HashMap::new();

    for (key, value) in labels {
        let Some(caps) = re.captures(key) else {
            continue;
        };
        let kind_str = &caps[1];
        let jobname = caps[2].to_string();
        let field = caps[3].to_string();

        let Ok(job_type) = kind_str.parse::<JobType>() else {
            tracing::warn!(container = %container_name, label = %key, kind = %kind_str, "unknown job type in label");
            continue;
        };

        grouped
            .entry((job_type, jobname))
            .or_default()
            .entry(field)
            .or_default()
            .push(value.clone());
    }

    let mut candidates = Vec::new();
    for ((job_type, jobname), mut fields) in grouped {
        // Exec jobs default their target container to the labelling
        // container unless an explicit `.container` field overrides it
        // (spec.md §4.5).
        if job_type == JobType::Exec && !fields.contains_key("container") {
            fields.insert("container".into(), vec![container_name.to_string()]);
        }

        candidates.push(LabelJobCandidate {
            job_type,
            name: format!("{}.{}", scope, jobname),
            fields,
        });
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn scopes_by_compose_service() {
        let l = labels(&[
            ("com.docker.compose.service", "db"),
            ("ofelia.job-exec.backup.schedule", "@daily"),
            ("ofelia.job-exec.backup.command", "pg_dump"),
        ]);
        let candidates = parse_container_labels("myproj-db-1", &l, "ofelia").unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "db.backup");
    }

    #[test]
    fn scopes_by_container_name_without_compose_label() {
        let l = labels(&[
            ("ofelia.job-exec.backup.schedule", "@daily"),
            ("ofelia.job-exec.backup.command", "pg_dump"),
        ]);
        let candidates = parse_container_labels("c1", &l, "ofelia").unwrap();
        assert_eq!(candidates[0].name, "c1.backup");
    }

    #[test]
    fn exec_defaults_container_to_labelling_container() {
        let l = labels(&[
            ("ofelia.job-exec.foo.schedule", "@hourly"),
            ("ofelia.job-exec.foo.command", "echo hi"),
        ]);
        let candidates = parse_container_labels("c1", &l, "ofelia").unwrap();
        assert_eq!(
            candidates[0].fields.get("container").unwrap(),
            &vec!["c1".to_string()]
        );
    }

    #[test]
    fn required_label_gate() {
        let l = labels(&[("ofelia.enabled", "true")]);
        let prefixes = vec!["ofelia".to_string()];
        assert_eq!(enabled_prefix(&l, &prefixes), Some("ofelia"));
        let l2 = labels(&[]);
        assert_eq!(enabled_prefix(&l2, &prefixes), None);
    }
}
