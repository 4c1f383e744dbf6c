//! Variable interpolation for job commands and environment values.
//!
//! Supports variables like:
//! - `${revision}` - The source revision being built
//! - `${revision.short}` - First 7 characters of the revision
//! - `${job.name}` - Name of the job being run
//! - `${project.name}` - Project name from the job table
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)

use buildchain_core::{JobSpec, RequestKey};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Variable context for one job run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub revision: String,
    pub job: String,
    pub project: String,
    pub env: HashMap<String, String>,
}

impl VariableContext {
    /// Context for running the job named in `key` at its revision.
    pub fn for_request(key: &RequestKey) -> Self {
        Self {
            revision: key.revision.to_string(),
            job: key.job_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["revision"] => Some(self.revision.clone()),
            ["revision", "short"] => Some(self.revision.chars().take(7).collect()),
            ["job", "name"] => Some(self.job.clone()),
            ["project", "name"] => Some(self.project.clone()),
            ["env", name] => self.env.get(*name).cloned(),
            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// A copy of `spec` with commands, env values and working dir interpolated.
    pub fn apply(&self, spec: &JobSpec) -> JobSpec {
        let mut resolved = spec.clone();
        resolved.commands = self.interpolate_vec(&spec.commands);
        resolved.env = self.interpolate_map(&spec.env);
        resolved.working_dir = spec.working_dir.as_deref().map(|dir| self.interpolate(dir));
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_variables() {
        let key = RequestKey::new("test", "0123456789abcdef");
        let ctx = VariableContext::for_request(&key).with_project("demo");

        assert_eq!(
            ctx.interpolate("${project.name}/${job.name} @ ${revision.short}"),
            "demo/test @ 0123456"
        );
        assert_eq!(ctx.interpolate("${revision}"), "0123456789abcdef");
    }

    #[test]
    fn test_env_variables() {
        let mut ctx = VariableContext::for_request(&RequestKey::new("build", "r1"));
        ctx.env.insert("HOME".to_string(), "/home/ci".to_string());

        assert_eq!(
            ctx.interpolate("${env.HOME}/out/${job.name}"),
            "/home/ci/out/build"
        );
        assert_eq!(ctx.interpolate("${env.MISSING}"), "${env.MISSING}");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::default();
        assert_eq!(
            ctx.interpolate("Unknown: ${unknown.var}"),
            "Unknown: ${unknown.var}"
        );
    }

    #[test]
    fn test_apply_to_spec() {
        let mut spec = JobSpec::new("build").run("make REV=${revision}");
        spec.env.insert("OUT".to_string(), "out/${job.name}".to_string());
        spec.working_dir = Some("/src/${revision}".to_string());

        let ctx = VariableContext::for_request(&RequestKey::new("build", "r42"));
        let resolved = ctx.apply(&spec);

        assert_eq!(resolved.commands, vec!["make REV=r42"]);
        assert_eq!(resolved.env["OUT"], "out/build");
        assert_eq!(resolved.working_dir.as_deref(), Some("/src/r42"));
        // the original is untouched
        assert_eq!(spec.commands, vec!["make REV=${revision}"]);
    }
}
