use crate::error::ValidationIssue;
use crate::parallel::{generate_dynamic_jobs, FanInConfig, FanOutConfig};
use crate::types::{JobConfig, JobId, JobType};
use std::collections::{HashMap, HashSet};

/// Merge every fan-out's generated jobs into the graph ahead of execution.
///
/// Generated jobs depend on their fan-out job and follow it in the returned
/// order; each fan-in referencing a fan-out gains a dependency on all of its
/// generated jobs. Jobs already present by id are not generated again, so
/// expanding an expanded graph is a no-op.
pub fn expand_fan_outs(jobs: &[JobConfig]) -> Result<Vec<JobConfig>, Vec<ValidationIssue>> {
    let existing: HashSet<&JobId> = jobs.iter().map(|job| &job.id).collect();
    let mut issues = Vec::new();
    let mut generated: HashMap<JobId, Vec<JobConfig>> = HashMap::new();

    for job in jobs.iter().filter(|job| job.job_type == JobType::FanOut) {
        match FanOutConfig::from_job(job) {
            Ok(config) => {
                let children = generate_dynamic_jobs(&job.id, &config, std::slice::from_ref(&job.id));
                tracing::debug!("Fan-out {} expands to {} jobs", job.id, children.jobs.len());
                generated.insert(job.id.clone(), children.jobs);
            }
            Err(e) => issues.push(ValidationIssue::InvalidConfig {
                job_id: job.id.clone(),
                message: e.to_string(),
            }),
        }
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    let mut expanded = Vec::with_capacity(jobs.len());
    for job in jobs {
        let mut job = job.clone();

        if job.job_type == JobType::FanIn {
            if let Ok(fan_in) = FanInConfig::from_job(&job) {
                for child in generated.get(&fan_in.fan_out_job_id).into_iter().flatten() {
                    if !job.depends_on.contains(&child.id) {
                        job.depends_on.push(child.id.clone());
                    }
                }
            }
        }

        let children = if job.job_type == JobType::FanOut {
            generated.get(&job.id).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };

        expanded.push(job);
        expanded.extend(
            children
                .into_iter()
                .filter(|child| !existing.contains(&child.id)),
        );
    }

    Ok(expanded)
}
