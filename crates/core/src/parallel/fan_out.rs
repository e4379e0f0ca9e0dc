use crate::error::JobError;
use crate::types::{ConcurrencyLimit, JobConfig, JobId, JobType, RetryConfig};
use crate::workflow::{JobContext, JobHandler};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// One swept parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub values: Vec<Value>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

/// Shape of every generated job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutTemplate {
    pub name_pattern: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `config` of a `fan-out` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutConfig {
    pub template: FanOutTemplate,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_jobs: Option<usize>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl FanOutConfig {
    pub fn from_job(job: &JobConfig) -> Result<Self, JobError> {
        let config: Self = serde_json::from_value(job.config.clone()).map_err(|e| {
            JobError::invalid_config(format!("fan-out job '{}': {}", job.id, e))
        })?;
        config.check().map_err(JobError::invalid_config)?;
        Ok(config)
    }

    fn check(&self) -> Result<(), String> {
        if matches!(self.template.job_type, JobType::FanOut | JobType::FanIn) {
            return Err(format!(
                "template type '{}' cannot be generated by a fan-out",
                self.template.job_type
            ));
        }
        if self.max_parallel_jobs == Some(0) {
            return Err("maxParallelJobs must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        for spec in &self.parameters {
            if spec.name.is_empty() {
                return Err("parameter name must not be empty".to_string());
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(format!("parameter '{}' is declared twice", spec.name));
            }
        }
        Ok(())
    }
}

/// Ordered `(name, value)` pairs, one per parameter spec
pub type ParameterCombination = Vec<(String, Value)>;

/// Cartesian product of all parameter values. Earlier specs vary slower.
pub fn generate_parameter_combinations(specs: &[ParameterSpec]) -> Vec<ParameterCombination> {
    let mut combinations: Vec<ParameterCombination> = vec![Vec::new()];

    for spec in specs {
        combinations = combinations
            .into_iter()
            .flat_map(|prefix| {
                spec.values.iter().map(move |value| {
                    let mut combination = prefix.clone();
                    combination.push((spec.name.clone(), value.clone()));
                    combination
                })
            })
            .collect();
    }

    combinations
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute `${name}` tokens. Non-string values are inserted as JSON text.
pub fn replace_placeholders(template: &str, params: &[(String, Value)]) -> String {
    params.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("${{{name}}}"), &value_text(value))
    })
}

/// Substitute into every string leaf, recursing through objects and arrays
pub fn replace_placeholders_in_value(value: &Value, params: &[(String, Value)]) -> Value {
    match value {
        Value::String(s) => Value::String(replace_placeholders(s, params)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| replace_placeholders_in_value(item, params))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), replace_placeholders_in_value(item, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Provenance of a generated job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedJobMetadata {
    pub source_job_id: JobId,
    pub parameter_values: serde_json::Map<String, Value>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GeneratedJobs {
    pub jobs: Vec<JobConfig>,
    pub metadata: HashMap<JobId, GeneratedJobMetadata>,
}

fn sanitize_suffix(combination: &ParameterCombination) -> String {
    combination
        .iter()
        .map(|(_, value)| value_text(value))
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Synthesise one job per parameter combination.
///
/// Ids are `{fan_out_id}_{index}_{suffix}`, so the same config always yields
/// the same ids. When `maxParallelJobs` is set, every generated job shares a
/// concurrency group named after the fan-out job.
pub fn generate_dynamic_jobs(
    fan_out_id: &JobId,
    config: &FanOutConfig,
    depends_on: &[JobId],
) -> GeneratedJobs {
    let generated_at = Utc::now();
    let concurrency_limit = config.max_parallel_jobs.map(|max| ConcurrencyLimit {
        group: fan_out_id.to_string(),
        max,
    });

    let mut jobs = Vec::new();
    let mut metadata = HashMap::new();

    for (index, combination) in generate_parameter_combinations(&config.parameters)
        .into_iter()
        .enumerate()
    {
        let id = JobId::new(format!(
            "{}_{}_{}",
            fan_out_id,
            index,
            sanitize_suffix(&combination)
        ));

        jobs.push(JobConfig {
            id: id.clone(),
            name: replace_placeholders(&config.template.name_pattern, &combination),
            job_type: config.template.job_type.clone(),
            depends_on: depends_on.to_vec(),
            config: replace_placeholders_in_value(&config.template.config, &combination),
            retry_config: config.template.retry_config.clone(),
            timeout_ms: config.template.timeout_ms,
            concurrency_limit: concurrency_limit.clone(),
        });

        metadata.insert(
            id,
            GeneratedJobMetadata {
                source_job_id: fan_out_id.clone(),
                parameter_values: combination.into_iter().collect(),
                generated_at,
            },
        );
    }

    GeneratedJobs { jobs, metadata }
}

/// Built-in handler for `fan-out` jobs. Computes the children; it never submits them.
pub struct FanOutHandler;

#[async_trait::async_trait]
impl JobHandler for FanOutHandler {
    async fn execute(&self, job: &JobConfig, ctx: &JobContext) -> Result<Value, JobError> {
        let config = FanOutConfig::from_job(job)?;
        let generated = generate_dynamic_jobs(&job.id, &config, std::slice::from_ref(&job.id));

        ctx.log(format!(
            "Generated {} jobs from {} parameters",
            generated.jobs.len(),
            config.parameters.len()
        ));

        let generated_ids: Vec<&JobId> = generated.jobs.iter().map(|j| &j.id).collect();
        let jobs = serde_json::to_value(&generated.jobs)
            .map_err(|e| JobError::handler(format!("failed to serialize generated jobs: {e}")))?;

        Ok(serde_json::json!({
            "generatedJobs": jobs,
            "generatedJobIds": generated_ids,
            "parameterCount": generated.jobs.len(),
            "sourceJobId": job.id,
        }))
    }

    fn validate(&self, job: &JobConfig) -> Result<(), String> {
        FanOutConfig::from_job(job).map(|_| ()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str, values: Vec<Value>) -> ParameterSpec {
        ParameterSpec {
            name: name.to_string(),
            values,
            value_type: None,
        }
    }

    fn sweep_config() -> FanOutConfig {
        serde_json::from_value(json!({
            "template": {
                "namePattern": "Train lr=${lr} bs=${batch}",
                "type": "train",
                "config": {
                    "optimizer": {"lr": "${lr}", "name": "adam"},
                    "batches": ["${batch}", 7, {"size": "${batch}"}],
                    "epochs": 3
                },
                "retryConfig": {"maxRetries": 2},
                "timeoutMs": 60000
            },
            "parameters": [
                {"name": "lr", "values": [0.1, 0.01]},
                {"name": "batch", "values": [32, 64, 128]}
            ],
            "maxParallelJobs": 2
        }))
        .unwrap()
    }

    #[test]
    fn test_combination_count_is_product() {
        let specs = vec![
            spec("a", vec![json!(1), json!(2)]),
            spec("b", vec![json!("x"), json!("y"), json!("z")]),
            spec("c", vec![json!(true), json!(false), json!(null), json!(0)]),
        ];
        let combinations = generate_parameter_combinations(&specs);
        assert_eq!(combinations.len(), 2 * 3 * 4);

        let distinct: HashSet<String> = combinations
            .iter()
            .map(|c| serde_json::to_string(c).unwrap())
            .collect();
        assert_eq!(distinct.len(), combinations.len());
    }

    #[test]
    fn test_earlier_specs_vary_slower() {
        let specs = vec![
            spec("a", vec![json!(1), json!(2)]),
            spec("b", vec![json!("x"), json!("y")]),
        ];
        let combinations = generate_parameter_combinations(&specs);
        let flat: Vec<(Value, Value)> = combinations
            .into_iter()
            .map(|c| (c[0].1.clone(), c[1].1.clone()))
            .collect();
        assert_eq!(
            flat,
            vec![
                (json!(1), json!("x")),
                (json!(1), json!("y")),
                (json!(2), json!("x")),
                (json!(2), json!("y")),
            ]
        );
    }

    #[test]
    fn test_no_specs_yields_single_empty_combination() {
        assert_eq!(generate_parameter_combinations(&[]), vec![Vec::new()]);
        assert!(generate_parameter_combinations(&[spec("a", vec![])]).is_empty());
    }

    #[test]
    fn test_replace_placeholders() {
        let params = vec![
            ("model".to_string(), json!("resnet")),
            ("layers".to_string(), json!(50)),
            ("extra".to_string(), json!({"dropout": 0.5})),
        ];
        assert_eq!(
            replace_placeholders("${model}-${layers} ${extra} ${unknown}", &params),
            r#"resnet-50 {"dropout":0.5} ${unknown}"#
        );
        // Regex metacharacters in values are inserted literally
        let tricky = vec![("p".to_string(), json!("a.*$1"))];
        assert_eq!(replace_placeholders("x=${p}", &tricky), "x=a.*$1");
    }

    #[test]
    fn test_generate_dynamic_jobs() {
        let config = sweep_config();
        let generated = generate_dynamic_jobs(&JobId::new("sweep"), &config, &[JobId::new("prep")]);

        assert_eq!(generated.jobs.len(), 6);
        let first = &generated.jobs[0];
        assert_eq!(first.id, JobId::new("sweep_0_0_1_32"));
        assert_eq!(first.name, "Train lr=0.1 bs=32");
        assert_eq!(first.job_type, JobType::custom("train"));
        assert_eq!(first.depends_on, vec![JobId::new("prep")]);
        assert_eq!(
            first.config,
            json!({
                "optimizer": {"lr": "0.1", "name": "adam"},
                "batches": ["32", 7, {"size": "32"}],
                "epochs": 3
            })
        );
        assert_eq!(first.retry_config.as_ref().unwrap().max_retries, 2);
        assert_eq!(first.timeout_ms, Some(60000));
        assert_eq!(
            first.concurrency_limit,
            Some(ConcurrencyLimit {
                group: "sweep".to_string(),
                max: 2
            })
        );

        assert_eq!(generated.jobs[5].id, JobId::new("sweep_5_0_01_128"));
        let meta = &generated.metadata[&JobId::new("sweep_5_0_01_128")];
        assert_eq!(meta.source_job_id, JobId::new("sweep"));
        assert_eq!(meta.parameter_values["lr"], json!(0.01));
        assert_eq!(meta.parameter_values["batch"], json!(128));
    }

    #[test]
    fn test_invalid_template_type() {
        let job = JobConfig::new("f", "F", JobType::FanOut).with_config(json!({
            "template": {"namePattern": "x", "type": "fan-out"},
            "parameters": []
        }));
        assert!(FanOutHandler.validate(&job).is_err());

        let missing = JobConfig::new("f", "F", JobType::FanOut).with_config(json!({"parameters": []}));
        assert!(matches!(
            FanOutConfig::from_job(&missing),
            Err(JobError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_handler_output() {
        let job = JobConfig::new("sweep", "Sweep", JobType::FanOut)
            .with_config(serde_json::to_value(sweep_config()).unwrap());
        let ctx = JobContext::with_outputs("sweep", vec![]);

        let output = FanOutHandler.execute(&job, &ctx).await.unwrap();
        assert_eq!(output["parameterCount"], json!(6));
        assert_eq!(output["sourceJobId"], json!("sweep"));
        assert_eq!(output["generatedJobIds"][0], json!("sweep_0_0_1_32"));
        assert_eq!(output["generatedJobs"][0]["dependsOn"], json!(["sweep"]));
        assert_eq!(output["generatedJobs"].as_array().unwrap().len(), 6);
    }
}
