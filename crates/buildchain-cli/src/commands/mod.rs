//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use buildchain_core::BuildRequest;
use buildchain_store::{PgRequestStore, RequestStore, create_pool};

pub fn validate(path: &str) -> Result<()> {
    match buildchain_config::load_jobs(path) {
        Ok(table) => {
            println!("Configuration is valid: {} ({} jobs)", table.project, table.graph.len());
            for (i, job) in table.graph.execution_order().iter().enumerate() {
                let needs = table.graph.dependencies(job);
                if needs.is_empty() {
                    println!("  {}. {}", i + 1, job);
                } else {
                    let needs: Vec<&str> = needs.iter().map(|j| j.as_str()).collect();
                    println!("  {}. {} (needs {})", i + 1, job, needs.join(", "));
                }
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub async fn status(database_url: &str, revision: &str) -> Result<()> {
    let pool = create_pool(database_url)
        .await
        .context("Failed to connect to database")?;
    let store = PgRequestStore::new(pool);

    let requests = store.list_revision(&revision.into()).await?;
    if requests.is_empty() {
        println!("No build requests for {}", revision);
        return Ok(());
    }
    print_requests(&requests);
    Ok(())
}

pub fn print_requests(requests: &[BuildRequest]) {
    println!("{:<24} {:<24} {:<20}", "JOB", "STATE", "REQUESTED");
    for request in requests {
        let state = if request.dispatch_failed() {
            format!("{} (not started)", request.state)
        } else {
            request.state.to_string()
        };
        println!(
            "{:<24} {:<24} {:<20}",
            request.key.job_id.to_string(),
            state,
            request.requested_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let (true, Some(error)) = (request.dispatch_failed(), &request.dispatch_error) {
            println!("  dispatch failed: {}", error);
        }
    }
}
