//! INI file parsing (spec.md §4.6, §6).
//!
//! Section grammar: `[global]`, `[job-<type> "<name>"]`,
//! `[webhook "<name>"]`. A configured path may be a glob; every matching
//! file is parsed and merged in lexicographic order, later files winning
//! on key collision within the same section.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ini::Ini;
use tracing::warn;

use crate::config::{GlobalConfig, RawFields};
use crate::error::ConfigError;
use crate::job::JobType;
use crate::middleware::mail::SmtpConfig;

/// One `[job-<type> "<name>"]` section, not yet validated into a
/// `JobDescriptor`.
pub struct IniJobSection {
    pub job_type: JobType,
    pub name: String,
    pub fields: RawFields,
}

/// Everything parsed out of one or more globbed INI files.
#[derive(Default)]
pub struct IniDocument {
    pub global: GlobalConfig,
    pub jobs: Vec<IniJobSection>,
    pub webhooks: HashMap<String, RawFields>,
}

/// Expand a glob and parse+merge every matching file in lexicographic
/// order (spec.md §4.6).
pub fn load_glob(pattern: &str) -> Result<IniDocument, ConfigError> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| ConfigError::InvalidIni {
            path: pattern.to_string(),
            reason: e.to_string(),
        })?
        .filter_map(|r| r.ok())
        .collect();
    paths.sort();

    if paths.is_empty() {
        // A bare path that isn't a glob pattern: treat literally.
        let direct = PathBuf::from(pattern);
        if direct.is_file() {
            paths.push(direct);
        }
    }

    let mut document = IniDocument::default();
    for path in paths {
        merge_file(&path, &mut document)?;
    }
    Ok(document)
}

fn merge_file(path: &Path, document: &mut IniDocument) -> Result<(), ConfigError> {
    let ini = Ini::load_from_file(path).map_err(|e| ConfigError::InvalidIni {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };

        let mut fields: RawFields = HashMap::new();
        for key in unique_keys(props) {
            let values: Vec<String> = props.get_all(key.as_str()).map(|v| v.to_string()).collect();
            fields.entry(key).or_default().extend(values);
        }

        if section == "global" {
            apply_global(&fields, &mut document.global);
            continue;
        }

        if let Some(rest) = section.strip_prefix("webhook ") {
            let name = unquote(rest);
            document.webhooks.entry(name).or_default().extend(fields.clone());
            continue;
        }

        if let Some((kind, rest)) = section.split_once(' ') {
            if let Ok(job_type) = kind.parse::<JobType>() {
                let name = unquote(rest);
                document.jobs.push(IniJobSection {
                    job_type,
                    name,
                    fields,
                });
                continue;
            }
        }

        warn!(section = %section, "unrecognized INI section, ignored");
    }

    Ok(())
}

fn unique_keys(props: &ini::Properties) -> Vec<String> {
    let mut seen = Vec::new();
    for (k, _) in props.iter() {
        if !seen.contains(&k.to_string()) {
            seen.push(k.to_string());
        }
    }
    seen
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}

fn apply_global(fields: &RawFields, global: &mut GlobalConfig) {
    let scalar = |key: &str| fields.get(key).and_then(|v| v.last()).cloned();
    let bool_of = |key: &str, default: bool| {
        scalar(key).and_then(|s| s.parse().ok()).unwrap_or(default)
    };

    if let Some(v) = scalar("log-level") {
        global.log_level = v;
    }
    global.enable_web = bool_of("enable-web", global.enable_web);
    if let Some(v) = scalar("web-address") {
        global.web_address = v;
    }
    global.save_folder = scalar("save-folder").or_else(|| global.save_folder.clone());
    global.save_only_on_error = bool_of("save-only-on-error", global.save_only_on_error);
    global.restore_history_enabled = bool_of("restore-history-enabled", global.restore_history_enabled);
    if let Some(v) = scalar("restore-history-max-age") {
        global.restore_history_max_age = humantime::parse_duration(&v).ok();
    }
    if let Some(v) = scalar("max-runtime") {
        if let Ok(d) = humantime::parse_duration(&v) {
            global.max_runtime = d;
        }
    }
    if let Some(v) = scalar("notification-cooldown") {
        if let Ok(d) = humantime::parse_duration(&v) {
            global.notification_cooldown = d;
        }
    }
    global.allow_host_jobs_from_labels = bool_of(
        "allow-host-jobs-from-labels",
        global.allow_host_jobs_from_labels,
    );
    if let Some(values) = fields.get("webhook-allowed-hosts") {
        global.webhook_allowed_hosts = values.clone();
    }
    global.slack_webhook = scalar("slack-webhook").or_else(|| global.slack_webhook.clone());
    if let Some(values) = fields.get("mail-to") {
        global.mail_to = values.clone();
    }

    let smtp_host = scalar("smtp-host");
    if let Some(host) = smtp_host {
        global.smtp = Some(SmtpConfig {
            host,
            port: scalar("smtp-port").and_then(|s| s.parse().ok()).unwrap_or(587),
            username: scalar("smtp-user").unwrap_or_default(),
            password: scalar("smtp-password").unwrap_or_default(),
            from: scalar("mail-from").unwrap_or_default(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_global_and_job_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[global]
log-level = debug
max-runtime = 30s

[job-exec "a"]
schedule = @every 2s
container = c
command = echo a
"#
        )
        .unwrap();

        let doc = load_glob(file.path().to_str().unwrap()).unwrap();
        assert_eq!(doc.global.log_level, "debug");
        assert_eq!(doc.jobs.len(), 1);
        assert_eq!(doc.jobs[0].job_type, JobType::Exec);
        assert_eq!(doc.jobs[0].name, "a");
    }

    #[test]
    fn shadowed_keys_collect_into_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[job-exec "a"]
schedule = @hourly
container = c
command = echo a
environment = A=1
environment = B=2
"#
        )
        .unwrap();

        let doc = load_glob(file.path().to_str().unwrap()).unwrap();
        let fields = &doc.jobs[0].fields;
        assert_eq!(fields.get("environment").unwrap().len(), 2);
    }
}
