use crate::canonical::canonical_json;
use crate::error::JobError;
use crate::types::{JobConfig, JobId};
use crate::workflow::{JobContext, JobHandler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Caller-supplied aggregation over the raw collected outputs
pub type CustomAggregator = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationStrategy {
    #[default]
    CollectAll,
    BestMetric,
    WorstMetric,
    AverageMetrics,
    MajorityVote,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    #[serde(default)]
    pub strategy: AggregationStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub ascending: bool,
    /// Name of an aggregator registered on the orchestrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_aggregator: Option<String>,
}

/// `config` of a `fan-in` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanInConfig {
    pub fan_out_job_id: JobId,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

impl FanInConfig {
    pub fn from_job(job: &JobConfig) -> Result<Self, JobError> {
        serde_json::from_value(job.config.clone())
            .map_err(|e| JobError::invalid_config(format!("fan-in job '{}': {}", job.id, e)))
    }
}

/// Metric value at the top level of an output, else under `metrics`
fn metric(output: &Value, name: &str) -> Option<f64> {
    output
        .get(name)
        .and_then(Value::as_f64)
        .or_else(|| output.get("metrics")?.get(name)?.as_f64())
}

/// Output with the extreme metric. `prefer_high` picks the maximum; first seen wins ties.
fn select_by_metric(outputs: &[Value], name: &str, prefer_high: bool) -> Value {
    let mut best: Option<(f64, &Value)> = None;
    for output in outputs {
        let Some(value) = metric(output, name) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((current, _)) if prefer_high => value > current,
            Some((current, _)) => value < current,
        };
        if better {
            best = Some((value, output));
        }
    }
    best.map(|(_, output)| output.clone()).unwrap_or(Value::Null)
}

fn average_metrics(outputs: &[Value]) -> Value {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();

    for output in outputs {
        let source = match output.get("metrics") {
            Some(Value::Object(metrics)) => metrics,
            _ => match output {
                Value::Object(map) => map,
                _ => continue,
            },
        };
        for (key, value) in source {
            if let Some(n) = value.as_f64() {
                let entry = sums.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += n;
                entry.1 += 1;
            }
        }
    }

    Value::Object(
        sums.into_iter()
            .map(|(key, (sum, count))| (key, serde_json::json!(sum / count as f64)))
            .collect(),
    )
}

fn majority_vote(outputs: &[Value]) -> Value {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (index, output) in outputs.iter().enumerate() {
        counts.entry(canonical_json(output)).or_insert((0, index)).0 += 1;
    }

    counts
        .into_values()
        // Highest count, then earliest first occurrence
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, index)| outputs[index].clone())
        .unwrap_or(Value::Null)
}

fn required_metric(config: &AggregationConfig) -> Result<&str, JobError> {
    config
        .metric_name
        .as_deref()
        .ok_or_else(|| JobError::invalid_config("metricName is required for metric strategies"))
}

/// Combine collected outputs according to the configured strategy
pub fn aggregate_results(
    outputs: &[Value],
    config: &AggregationConfig,
    aggregators: &HashMap<String, CustomAggregator>,
) -> Result<Value, JobError> {
    match config.strategy {
        AggregationStrategy::CollectAll => Ok(Value::Array(outputs.to_vec())),
        AggregationStrategy::BestMetric => Ok(select_by_metric(
            outputs,
            required_metric(config)?,
            !config.ascending,
        )),
        AggregationStrategy::WorstMetric => Ok(select_by_metric(
            outputs,
            required_metric(config)?,
            config.ascending,
        )),
        AggregationStrategy::AverageMetrics => Ok(average_metrics(outputs)),
        AggregationStrategy::MajorityVote => Ok(majority_vote(outputs)),
        AggregationStrategy::Custom => {
            let name = config.custom_aggregator.as_deref().ok_or_else(|| {
                JobError::invalid_config("customAggregator is required for the custom strategy")
            })?;
            let aggregator = aggregators.get(name).ok_or_else(|| {
                JobError::invalid_config(format!("unknown custom aggregator '{name}'"))
            })?;
            aggregator(outputs).map_err(JobError::handler)
        }
    }
}

/// Built-in handler for `fan-in` jobs
pub struct FanInHandler {
    aggregators: HashMap<String, CustomAggregator>,
}

impl FanInHandler {
    pub fn new(aggregators: HashMap<String, CustomAggregator>) -> Self {
        Self { aggregators }
    }
}

#[async_trait::async_trait]
impl JobHandler for FanInHandler {
    async fn execute(&self, job: &JobConfig, ctx: &JobContext) -> Result<Value, JobError> {
        let config = FanInConfig::from_job(job)?;
        let source_id = config.fan_out_job_id.as_str();

        let source = ctx.job_output(source_id).ok_or_else(|| {
            JobError::handler(format!("fan-out job '{source_id}' has no output"))
        })?;
        let generated_ids: Vec<String> = source
            .get("generatedJobIds")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                JobError::handler(format!("output of '{source_id}' has no generatedJobIds"))
            })?
            .iter()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect();

        let mut outputs = Vec::with_capacity(generated_ids.len());
        let mut missing = Vec::new();
        for id in generated_ids {
            match ctx.job_output(&id) {
                Some(output) => outputs.push(output),
                None => {
                    tracing::warn!("Fan-in {} skipping {}: no output", job.id, id);
                    ctx.log(format!("Skipping {id}: no output available"));
                    missing.push(id);
                }
            }
        }

        if outputs.is_empty() {
            return Err(JobError::handler(format!(
                "no outputs to aggregate from fan-out job '{source_id}'"
            )));
        }

        ctx.log(format!(
            "Aggregating {} outputs with {:?}",
            outputs.len(),
            config.aggregation.strategy
        ));
        let aggregated = aggregate_results(&outputs, &config.aggregation, &self.aggregators)?;

        Ok(serde_json::json!({
            "aggregatedResult": aggregated,
            "strategy": config.aggregation.strategy,
            "inputCount": outputs.len(),
            "sourceJobId": config.fan_out_job_id,
            "missingJobIds": missing,
        }))
    }

    fn validate(&self, job: &JobConfig) -> Result<(), String> {
        let config = FanInConfig::from_job(job).map_err(|e| e.to_string())?;
        let aggregation = &config.aggregation;

        match aggregation.strategy {
            AggregationStrategy::BestMetric | AggregationStrategy::WorstMetric => {
                required_metric(aggregation).map_err(|e| e.to_string())?;
            }
            AggregationStrategy::Custom => match aggregation.custom_aggregator.as_deref() {
                None => return Err("customAggregator is required for the custom strategy".into()),
                Some(name) if !self.aggregators.contains_key(name) => {
                    return Err(format!("unknown custom aggregator '{name}'"));
                }
                Some(_) => {}
            },
            _ => {}
        }
        Ok(())
    }
}
