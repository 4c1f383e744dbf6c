//! Job definitions and the validated job graph built from them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::graph::{DependencyGraph, GraphError, NodeId};
use crate::{Error, JobId, Result};

/// Everything the execution backend needs to run a job.
///
/// The orchestration engine only reads `name` and `needs`; the rest is passed
/// through to the dispatcher untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name, unique within a job table.
    pub name: JobId,
    /// Jobs that must succeed for the same revision before this one runs.
    pub needs: Vec<JobId>,
    /// Shell commands, run in order.
    pub commands: Vec<String>,
    /// Working directory for the commands.
    pub working_dir: Option<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Maximum execution time, enforced by the backend.
    pub timeout: Option<Duration>,
}

impl JobSpec {
    pub fn new(name: impl Into<JobId>) -> Self {
        Self {
            name: name.into(),
            needs: Vec::new(),
            commands: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn needs(mut self, dependency: impl Into<JobId>) -> Self {
        self.needs.push(dependency.into());
        self
    }

    pub fn run(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }
}

/// An acyclic set of jobs, immutable once built.
#[derive(Debug, Clone)]
pub struct JobGraph {
    graph: DependencyGraph,
    nodes: HashMap<JobId, NodeId>,
    jobs: Vec<JobSpec>,
    order: Vec<NodeId>,
}

impl JobGraph {
    /// Build the graph, rejecting duplicate names, dangling `needs` and cycles.
    pub fn new(jobs: Vec<JobSpec>) -> Result<Self> {
        let mut graph = DependencyGraph::new();
        let mut nodes = HashMap::with_capacity(jobs.len());

        for job in &jobs {
            let node = graph.add_node();
            if nodes.insert(job.name.clone(), node).is_some() {
                return Err(Error::DuplicateJob(job.name.clone()));
            }
        }

        for job in &jobs {
            let from = nodes[&job.name];
            for dependency in &job.needs {
                let to = nodes
                    .get(dependency)
                    .copied()
                    .ok_or_else(|| Error::UnknownDependency {
                        job: job.name.clone(),
                        dependency: dependency.clone(),
                    })?;
                graph.add_edge(from, to)?;
            }
        }

        let order = graph.topological_sort().map_err(|e| match e {
            GraphError::Cycle(node) => Error::DependencyCycle(jobs[node.index()].name.clone()),
            other => Error::Graph(other),
        })?;

        Ok(Self {
            graph,
            nodes,
            jobs,
            order,
        })
    }

    pub fn contains(&self, job: &JobId) -> bool {
        self.nodes.contains_key(job)
    }

    pub fn job(&self, job: &JobId) -> Option<&JobSpec> {
        self.nodes.get(job).map(|node| &self.jobs[node.index()])
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs that `job` directly depends on. Empty for unknown jobs.
    pub fn dependencies(&self, job: &JobId) -> Vec<JobId> {
        match self.nodes.get(job) {
            Some(node) => self.names(self.graph.children(*node).unwrap_or(&[])),
            None => Vec::new(),
        }
    }

    /// All jobs, dependencies before dependents.
    pub fn execution_order(&self) -> Vec<JobId> {
        self.names(&self.order)
    }

    fn names(&self, nodes: &[NodeId]) -> Vec<JobId> {
        nodes
            .iter()
            .map(|node| self.jobs[node.index()].name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Vec<JobSpec> {
        vec![
            JobSpec::new("deploy").needs("test").run("./deploy.sh"),
            JobSpec::new("build").run("make"),
            JobSpec::new("test").needs("build").run("make test"),
        ]
    }

    #[test]
    fn test_dependencies() {
        let graph = JobGraph::new(chain()).unwrap();
        assert_eq!(graph.dependencies(&"test".into()), vec![JobId::from("build")]);
        assert_eq!(graph.dependencies(&"deploy".into()), vec![JobId::from("test")]);
        assert!(graph.dependencies(&"build".into()).is_empty());
        assert!(graph.dependencies(&"missing".into()).is_empty());
    }

    #[test]
    fn test_execution_order() {
        let graph = JobGraph::new(chain()).unwrap();
        let order: Vec<String> = graph
            .execution_order()
            .into_iter()
            .map(|j| j.to_string())
            .collect();
        assert_eq!(order, vec!["build", "test", "deploy"]);
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let jobs = vec![JobSpec::new("build"), JobSpec::new("build")];
        assert!(matches!(
            JobGraph::new(jobs),
            Err(Error::DuplicateJob(name)) if name.as_str() == "build"
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let jobs = vec![JobSpec::new("test").needs("build")];
        assert!(matches!(
            JobGraph::new(jobs),
            Err(Error::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let jobs = vec![
            JobSpec::new("a").needs("b"),
            JobSpec::new("b").needs("a"),
        ];
        match JobGraph::new(jobs) {
            Err(Error::DependencyCycle(job)) => assert!(["a", "b"].contains(&job.as_str())),
            other => panic!("expected cycle, got {:?}", other),
        }
    }
}
