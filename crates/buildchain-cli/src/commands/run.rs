//! Local orchestration commands.

use anyhow::{Context, Result};
use buildchain_config::load_jobs;
use buildchain_core::{JobId, RequestOrigin, RequestState, SourceRevision};
use buildchain_executor::{Completion, LocalProcessDispatcher};
use buildchain_scheduler::{EngineEvent, OrchestrationEngine};
use buildchain_store::{MemoryRequestStore, PgRequestStore, RequestStore, create_pool, run_migrations};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::print_requests;

pub struct RunOptions {
    pub config_path: String,
    pub database_url: Option<String>,
    pub events_json: bool,
}

/// Run `job` for `revision`, plus everything it needs, on this host.
pub async fn run(
    opts: &RunOptions,
    job: &str,
    revision: &str,
    requested_by: Option<String>,
) -> Result<()> {
    let mut session = Session::open(opts).await?;
    let job = JobId::from(job);
    let revision = SourceRevision::from(revision);

    if opts.database_url.is_some() {
        let revisions = session.engine.recover().await?;
        if revisions > 0 {
            info!(revisions, "Resumed pending work from a previous run");
        }
    }

    let origin = requested_by
        .map(RequestOrigin::requested_by)
        .unwrap_or_else(RequestOrigin::external);
    let ensured = session.engine.ensure(&job, &revision, origin).await;
    session.drive().await;
    ensured?;

    session.finish(&job, &revision).await
}

/// Report a result for `job` at `revision`, then run whatever it unblocks.
pub async fn complete(opts: &RunOptions, job: &str, revision: &str, success: bool) -> Result<()> {
    let mut session = Session::open(opts).await?;
    let job = JobId::from(job);
    let revision = SourceRevision::from(revision);

    session
        .engine
        .on_job_completed(&job, &revision, success)
        .await?;
    session.drive().await;

    let requests = session.engine.requests_for(&revision).await?;
    println!();
    print_requests(&requests);
    Ok(())
}

struct Session {
    engine: OrchestrationEngine,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    completions: mpsc::UnboundedReceiver<Completion>,
    events_json: bool,
    in_flight: usize,
}

impl Session {
    async fn open(opts: &RunOptions) -> Result<Self> {
        let table = load_jobs(&opts.config_path)
            .with_context(|| format!("Failed to load job table: {}", opts.config_path))?;

        let store: Arc<dyn RequestStore> = match &opts.database_url {
            Some(url) => {
                let pool = create_pool(url)
                    .await
                    .context("Failed to connect to database")?;
                run_migrations(&pool)
                    .await
                    .context("Failed to run migrations")?;
                Arc::new(PgRequestStore::new(pool))
            }
            None => Arc::new(MemoryRequestStore::new()),
        };

        let (dispatcher, completions) = LocalProcessDispatcher::new(table.project.clone());
        let mut engine =
            OrchestrationEngine::new(Arc::new(table.graph), store, Arc::new(dispatcher));
        let events = engine.subscribe();

        println!("Project: {}", table.project);
        Ok(Self {
            engine,
            events,
            completions,
            events_json: opts.events_json,
            in_flight: 0,
        })
    }

    /// Feed completions back into the engine until nothing started here is running.
    async fn drive(&mut self) {
        self.drain_events();

        while self.in_flight > 0 {
            let Some(completion) = self.completions.recv().await else {
                warn!("Execution backend stopped reporting");
                return;
            };
            self.in_flight -= 1;

            let key = &completion.key;
            if let Err(e) = self
                .engine
                .on_job_completed(&key.job_id, &key.revision, completion.success)
                .await
            {
                warn!(job = %key.job_id, revision = %key.revision, error = %e, "Failed to record completion");
            }
            self.drain_events();
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if matches!(event, EngineEvent::Dispatched { .. }) {
                self.in_flight += 1;
            }
            self.print(&event);
        }
    }

    fn print(&self, event: &EngineEvent) {
        if self.events_json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to encode event"),
            }
            return;
        }

        match event {
            EngineEvent::RequestCreated { key, .. } => println!("○ {} requested", key),
            EngineEvent::Waiting { key, waiting_on } => {
                let names: Vec<&str> = waiting_on.iter().map(|j| j.as_str()).collect();
                println!("… {} waiting on {}", key, names.join(", "));
            }
            EngineEvent::Dispatched { key } => println!("▶ {} started", key),
            EngineEvent::DispatchFailed { key, error } => {
                println!("✗ {} could not be started: {}", key, error)
            }
            EngineEvent::Completed { key, success: true } => println!("✓ {} succeeded", key),
            EngineEvent::Completed { key, success: false } => println!("✗ {} failed", key),
            EngineEvent::Cancelled { key, cause } => {
                println!("⊘ {} cancelled, {} did not succeed", key, cause)
            }
            EngineEvent::DuplicateCompletion { key } => {
                println!("  {} already finished, ignoring report", key)
            }
        }
    }

    async fn finish(&self, job: &JobId, revision: &SourceRevision) -> Result<()> {
        let requests = self.engine.requests_for(revision).await?;
        println!("\n--- Summary for {} ---", revision);
        print_requests(&requests);

        let state = requests
            .iter()
            .find(|r| &r.key.job_id == job)
            .map(|r| r.state.clone());
        match state {
            Some(RequestState::Succeeded) => {
                println!("\n✓ {} succeeded", job);
                Ok(())
            }
            Some(state) if state.is_terminal() => anyhow::bail!("{} {}", job, state),
            Some(state) => anyhow::bail!(
                "{} is still {}, waiting on work started by another process",
                job,
                state
            ),
            None => anyhow::bail!("no build request recorded for {}", job),
        }
    }
}
