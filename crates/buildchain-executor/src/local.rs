//! Local process dispatcher implementation.

use async_trait::async_trait;
use buildchain_config::VariableContext;
use buildchain_core::{Dispatcher, Error, JobSpec, RequestKey, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of one job run, sent back to whoever drives the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub key: RequestKey,
    pub success: bool,
    /// Exit code of the last command run, `None` if it was killed or timed out.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Runs each job's commands through `sh -c` on this host.
///
/// `dispatch` only spawns the run and returns; the outcome arrives later as a
/// [`Completion`] on the channel handed out by [`LocalProcessDispatcher::new`].
pub struct LocalProcessDispatcher {
    completions: mpsc::UnboundedSender<Completion>,
    project: String,
    inherit_env: bool,
}

impl LocalProcessDispatcher {
    pub fn new(project: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            completions: tx,
            project: project.into(),
            inherit_env: true,
        };
        (dispatcher, rx)
    }

    /// Expose `${env.*}` variables from this process to job commands.
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    fn resolve(&self, key: &RequestKey, spec: &JobSpec) -> JobSpec {
        let mut ctx = VariableContext::for_request(key).with_project(self.project.clone());
        if self.inherit_env {
            ctx.populate_env();
        }
        ctx.apply(spec)
    }
}

#[async_trait]
impl Dispatcher for LocalProcessDispatcher {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn dispatch(&self, key: &RequestKey, spec: &JobSpec) -> Result<()> {
        if self.completions.is_closed() {
            return Err(Error::ExecutionFailed(
                "nobody is listening for completions".to_string(),
            ));
        }

        let spec = self.resolve(key, spec);
        let key = key.clone();
        let tx = self.completions.clone();

        info!(job = %key.job_id, revision = %key.revision, commands = spec.commands.len(), "Starting local job");
        tokio::spawn(async move {
            let completion = run_job(key, &spec).await;
            if tx.send(completion).is_err() {
                warn!(job = %spec.name, "Completion dropped, receiver is gone");
            }
        });
        Ok(())
    }
}

async fn run_job(key: RequestKey, spec: &JobSpec) -> Completion {
    let started = Instant::now();

    let outcome = match spec.timeout {
        Some(limit) => match tokio::time::timeout(limit, run_commands(spec)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(job = %key.job_id, revision = %key.revision, timeout = ?limit, "Job timed out");
                Err(None)
            }
        },
        None => run_commands(spec).await,
    };

    let (success, exit_code) = match outcome {
        Ok(code) => (true, Some(code)),
        Err(code) => (false, code),
    };
    let duration = started.elapsed();
    info!(job = %key.job_id, revision = %key.revision, success, ?exit_code, ?duration, "Local job finished");

    Completion {
        key,
        success,
        exit_code,
        duration,
    }
}

/// Run commands in order, stopping at the first failure.
/// Ok carries the last exit code; Err the failing one, if any.
async fn run_commands(spec: &JobSpec) -> std::result::Result<i32, Option<i32>> {
    let mut last = 0;

    for command in &spec.commands {
        debug!(job = %spec.name, %command, "Running command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(job = %spec.name, %command, error = %e, "Failed to start command");
                return Err(None);
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(job = %spec.name, stream = "stdout", "{}", line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            info!(job = %spec.name, stream = "stderr", "{}", line);
        }

        if !output.status.success() {
            warn!(job = %spec.name, %command, status = %output.status, "Command failed");
            return Err(output.status.code());
        }
        last = output.status.code().unwrap_or(0);
    }

    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(spec: JobSpec) -> Completion {
        let (dispatcher, mut rx) = LocalProcessDispatcher::new("demo");
        let key = RequestKey::new(spec.name.clone(), "0123456789abcdef");
        dispatcher.dispatch(&key, &spec).await.unwrap();
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_successful_job() {
        let completion = run(JobSpec::new("build").run("true").run("exit 0")).await;
        assert!(completion.success);
        assert_eq!(completion.exit_code, Some(0));
        assert_eq!(completion.key, RequestKey::new("build", "0123456789abcdef"));
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let marker = std::env::temp_dir().join(format!("buildchain-marker-{}", std::process::id()));
        let spec = JobSpec::new("test")
            .run("exit 3")
            .run(format!("touch {}", marker.display()));

        let completion = run(spec).await;
        assert!(!completion.success);
        assert_eq!(completion.exit_code, Some(3));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_variables_and_env_reach_commands() {
        let mut spec = JobSpec::new("deploy")
            .run(r#"test "${job.name}" = deploy"#)
            .run(r#"test "${revision.short}" = 0123456"#)
            .run(r#"test "$TARGET" = demo-0123456"#);
        spec.env
            .insert("TARGET".to_string(), "${project.name}-${revision.short}".to_string());

        let completion = run(spec).await;
        assert!(completion.success);
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = std::env::temp_dir();
        let expected = dir.canonicalize().unwrap();
        let mut spec =
            JobSpec::new("build").run(format!(r#"test "$(pwd -P)" = "{}""#, expected.display()));
        spec.working_dir = Some(dir.display().to_string());

        assert!(run(spec).await.success);
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let mut spec = JobSpec::new("slow").run("sleep 5");
        spec.timeout = Some(Duration::from_millis(100));

        let completion = run(spec).await;
        assert!(!completion.success);
        assert_eq!(completion.exit_code, None);
        assert!(completion.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dispatch_refused_without_listener() {
        let (dispatcher, rx) = LocalProcessDispatcher::new("demo");
        drop(rx);

        let err = dispatcher
            .dispatch(&RequestKey::new("build", "rev1"), &JobSpec::new("build"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(_)));
    }
}
