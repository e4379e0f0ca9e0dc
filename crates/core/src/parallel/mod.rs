//! Dynamic parallelism: fan-out job synthesis and fan-in aggregation

pub mod fan_in;
pub mod fan_out;

pub use fan_in::{
    aggregate_results, AggregationConfig, AggregationStrategy, CustomAggregator, FanInConfig,
    FanInHandler,
};
pub use fan_out::{
    generate_dynamic_jobs, generate_parameter_combinations, replace_placeholders,
    replace_placeholders_in_value, FanOutConfig, FanOutHandler, FanOutTemplate, GeneratedJobMetadata,
    GeneratedJobs, ParameterCombination, ParameterSpec,
};
