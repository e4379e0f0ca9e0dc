use crate::error::ValidationIssue;
use crate::parallel::FanInConfig;
use crate::types::{JobConfig, JobId, JobType};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Result of validating a job graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

/// Dependency graph over a slice of jobs.
///
/// Node weights are indices into the original slice, so every ordering the
/// graph produces can fall back to input order for ties.
pub struct JobDag<'a> {
    jobs: &'a [JobConfig],
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
    index: HashMap<&'a str, usize>,
}

impl<'a> JobDag<'a> {
    /// Build the graph, collecting duplicate ids and dangling references.
    /// Unknown dependencies get no edge; cycles are not rejected here.
    fn build(jobs: &'a [JobConfig]) -> (Self, Vec<ValidationIssue>) {
        let mut issues = Vec::new();
        let mut graph = DiGraph::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        let nodes: Vec<NodeIndex> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| {
                if index.contains_key(job.id.as_str()) {
                    issues.push(ValidationIssue::DuplicateJobId {
                        job_id: job.id.clone(),
                    });
                } else {
                    index.insert(job.id.as_str(), i);
                }
                graph.add_node(i)
            })
            .collect();

        for (i, job) in jobs.iter().enumerate() {
            for dep in &job.depends_on {
                match index.get(dep.as_str()) {
                    // Edge from dependency to dependent (dep -> job)
                    Some(&dep_idx) => {
                        graph.add_edge(nodes[dep_idx], nodes[i], ());
                    }
                    None => issues.push(ValidationIssue::MissingDependency {
                        job_id: job.id.clone(),
                        dependency: dep.clone(),
                    }),
                }
            }

            if job.job_type == JobType::FanIn {
                if let Ok(fan_in) = FanInConfig::from_job(job) {
                    if !index.contains_key(fan_in.fan_out_job_id.as_str()) {
                        issues.push(ValidationIssue::MissingFanOutSource {
                            job_id: job.id.clone(),
                            fan_out_job_id: fan_in.fan_out_job_id,
                        });
                    }
                }
            }
        }

        (
            Self {
                jobs,
                graph,
                nodes,
                index,
            },
            issues,
        )
    }

    /// Build a DAG, failing with every issue found if the graph is invalid
    pub fn from_jobs(jobs: &'a [JobConfig]) -> Result<Self, Vec<ValidationIssue>> {
        let (dag, mut issues) = Self::build(jobs);
        issues.extend(dag.cycles());
        if issues.is_empty() {
            Ok(dag)
        } else {
            Err(issues)
        }
    }

    /// Every cycle, reported once per strongly connected component
    fn cycles(&self) -> Vec<ValidationIssue> {
        let mut cycles: Vec<Vec<usize>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || self
                        .graph
                        .contains_edge(component[0], component[0])
            })
            .map(|component| {
                let mut members: Vec<usize> =
                    component.into_iter().map(|n| self.graph[n]).collect();
                members.sort_unstable();
                members
            })
            .collect();
        cycles.sort();

        cycles
            .into_iter()
            .map(|members| ValidationIssue::Cycle {
                job_ids: members.into_iter().map(|i| self.jobs[i].id.clone()).collect(),
            })
            .collect()
    }

    /// Jobs in dependency order; ties keep input order
    pub fn topological_order(&self) -> Vec<&'a JobConfig> {
        self.topological_indices()
            .into_iter()
            .map(|i| &self.jobs[i])
            .collect()
    }

    // Kahn's algorithm with the ready set ordered by input position
    fn topological_indices(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|&n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.jobs.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for next in self.graph.neighbors_directed(self.nodes[i], Direction::Outgoing) {
                let j = self.graph[next];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }

        order
    }

    /// Partition into levels: a job's level is one more than its deepest dependency
    pub fn levels(&self) -> Vec<Vec<&'a JobConfig>> {
        let mut depth = vec![0usize; self.jobs.len()];
        for i in self.topological_indices() {
            depth[i] = self
                .graph
                .neighbors_directed(self.nodes[i], Direction::Incoming)
                .map(|dep| depth[self.graph[dep]] + 1)
                .max()
                .unwrap_or(0);
        }

        let level_count = depth.iter().copied().max().map_or(0, |d| d + 1);
        let mut levels: Vec<Vec<&'a JobConfig>> = vec![Vec::new(); level_count];
        for (i, job) in self.jobs.iter().enumerate() {
            levels[depth[i]].push(job);
        }
        levels
    }

    /// Direct dependencies of a job
    pub fn dependencies(&self, job_id: &JobId) -> Vec<&'a JobId> {
        self.neighbors(job_id, Direction::Incoming)
    }

    /// Jobs that directly depend on the given job
    pub fn dependents(&self, job_id: &JobId) -> Vec<&'a JobId> {
        self.neighbors(job_id, Direction::Outgoing)
    }

    fn neighbors(&self, job_id: &JobId, direction: Direction) -> Vec<&'a JobId> {
        let Some(&i) = self.index.get(job_id.as_str()) else {
            return Vec::new();
        };
        let mut ids: Vec<usize> = self
            .graph
            .neighbors_directed(self.nodes[i], direction)
            .map(|n| self.graph[n])
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().map(|j| &self.jobs[j].id).collect()
    }
}

/// Check a job graph for duplicate ids, dangling references and cycles
pub fn validate(jobs: &[JobConfig]) -> ValidationReport {
    let (dag, mut errors) = JobDag::build(jobs);
    errors.extend(dag.cycles());
    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

/// Dependency-respecting order of a valid graph
pub fn topological_sort(jobs: &[JobConfig]) -> Result<Vec<&JobConfig>, Vec<ValidationIssue>> {
    Ok(JobDag::from_jobs(jobs)?.topological_order())
}

/// Level partition of a valid graph
pub fn execution_levels(jobs: &[JobConfig]) -> Result<Vec<Vec<&JobConfig>>, Vec<ValidationIssue>> {
    Ok(JobDag::from_jobs(jobs)?.levels())
}
