//! Job table parsing.
//!
//! ```kdl
//! project "chromium"
//!
//! env {
//!     CI "true"
//! }
//!
//! job "build" {
//!     run "make all"
//!     timeout "30m"
//! }
//!
//! job "test" needs="build" {
//!     run "make test"
//!     working-dir "out"
//!     env {
//!         GTEST_COLOR "0"
//!     }
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use buildchain_core::{JobGraph, JobId, JobSpec};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static JOB_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap());

static DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*(s|m|h)$").unwrap());

/// A parsed job table: a project name plus its validated job graph.
#[derive(Debug, Clone)]
pub struct JobTable {
    pub project: String,
    pub graph: JobGraph,
}

/// Read and parse a job table from a file.
pub fn load_jobs(path: impl AsRef<Path>) -> ConfigResult<JobTable> {
    let content = std::fs::read_to_string(path)?;
    parse_jobs(&content)
}

/// Parse a job table from KDL text.
pub fn parse_jobs(kdl: &str) -> ConfigResult<JobTable> {
    let doc: KdlDocument = kdl.parse()?;

    let mut project = String::new();
    let mut jobs = Vec::new();
    let mut env = HashMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                project = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;
            }
            "job" => {
                jobs.push(parse_job(node)?);
            }
            "env" => {
                env = parse_env(node);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if project.is_empty() {
        return Err(ConfigError::MissingField("project name".to_string()));
    }

    // Table-wide env is the base; job-level values win.
    for job in &mut jobs {
        for (key, value) in &env {
            job.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    let graph = JobGraph::new(jobs)?;

    Ok(JobTable { project, graph })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    if !JOB_NAME_REGEX.is_match(&name) {
        return Err(ConfigError::InvalidValue {
            field: "job name".to_string(),
            message: format!("'{}' must be alphanumeric with '_', '.' or '-'", name),
        });
    }

    let mut job = JobSpec::new(name.as_str());
    job.needs = get_string_list_prop(node, "needs")
        .into_iter()
        .map(JobId::from)
        .collect();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        job.commands.push(cmd);
                    }
                }
                "working-dir" | "working_dir" => {
                    job.working_dir = get_first_string_arg(child);
                }
                "timeout" => {
                    let raw = get_first_string_arg(child).unwrap_or_default();
                    job.timeout = Some(parse_duration(&raw).ok_or_else(|| {
                        ConfigError::InvalidValue {
                            field: format!("timeout for job '{}'", name),
                            message: format!("expected e.g. \"90s\", \"10m\" or \"2h\", got '{}'", raw),
                        }
                    })?);
                }
                "env" => {
                    job.env = parse_env(child);
                }
                _ => {}
            }
        }
    }

    if job.commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run command for job '{}'",
            name
        )));
    }

    Ok(job)
}

fn parse_env(node: &KdlNode) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

/// Parse "90s", "10m" or "2h".
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let caps = DURATION_REGEX.captures(raw.trim())?;
    let amount: u64 = caps[1].parse().ok()?;
    let seconds = match &caps[2] {
        "s" => amount,
        "m" => amount.checked_mul(60)?,
        "h" => amount.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated properties: needs="a" needs="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: needs "a" "b"
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_table() {
        let kdl = r#"
            project "demo"

            job "build" {
                run "cargo build"
            }
        "#;

        let table = parse_jobs(kdl).unwrap();
        assert_eq!(table.project, "demo");
        assert_eq!(table.graph.len(), 1);
        let build = table.graph.job(&"build".into()).unwrap();
        assert_eq!(build.commands, vec!["cargo build"]);
        assert!(build.needs.is_empty());
    }

    #[test]
    fn test_parse_dependencies_both_syntaxes() {
        let kdl = r#"
            project "demo"

            job "build" {
                run "make"
            }

            job "lint" {
                run "make lint"
            }

            job "test" needs="build" needs="lint" {
                run "make test"
            }

            job "deploy" {
                needs "test"
                run "./deploy.sh"
            }
        "#;

        let table = parse_jobs(kdl).unwrap();
        let mut test_deps = table.graph.dependencies(&"test".into());
        test_deps.sort();
        assert_eq!(test_deps, vec![JobId::from("build"), JobId::from("lint")]);
        assert_eq!(
            table.graph.dependencies(&"deploy".into()),
            vec![JobId::from("test")]
        );
    }

    #[test]
    fn test_env_merging_and_options() {
        let kdl = r#"
            project "demo"

            env {
                CI "true"
                LEVEL "global"
            }

            job "build" {
                run "make"
                working-dir "src"
                timeout "10m"
                env {
                    LEVEL "job"
                }
            }
        "#;

        let table = parse_jobs(kdl).unwrap();
        let build = table.graph.job(&"build".into()).unwrap();
        assert_eq!(build.env.get("CI").map(String::as_str), Some("true"));
        assert_eq!(build.env.get("LEVEL").map(String::as_str), Some("job"));
        assert_eq!(build.working_dir.as_deref(), Some("src"));
        assert_eq!(build.timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_missing_project() {
        let kdl = r#"
            job "build" {
                run "make"
            }
        "#;
        assert!(matches!(
            parse_jobs(kdl),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_missing_run_command() {
        let kdl = r#"
            project "demo"
            job "build"
        "#;
        assert!(matches!(
            parse_jobs(kdl),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_job_name() {
        let kdl = r#"
            project "demo"
            job "build all" {
                run "make"
            }
        "#;
        assert!(matches!(
            parse_jobs(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_detect_missing_dependency() {
        let kdl = r#"
            project "demo"

            job "build" needs="nonexistent" {
                run "make"
            }
        "#;
        assert!(matches!(
            parse_jobs(kdl),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_detect_duplicate() {
        let kdl = r#"
            project "demo"

            job "build" {
                run "make"
            }

            job "build" {
                run "make again"
            }
        "#;
        assert!(matches!(parse_jobs(kdl), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_detect_cycle() {
        let kdl = r#"
            project "cyclic"

            job "a" needs="b" {
                run "echo a"
            }

            job "b" needs="a" {
                run "echo b"
            }
        "#;
        assert!(matches!(
            parse_jobs(kdl),
            Err(ConfigError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5d"), None);
    }

    #[test]
    fn test_invalid_timeout() {
        let kdl = r#"
            project "demo"
            job "build" {
                run "make"
                timeout "forever"
            }
        "#;
        assert!(matches!(
            parse_jobs(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
