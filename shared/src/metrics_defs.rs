//! Common types for metrics definitions.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

impl fmt::Display for MetricDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<32} {:<10} {}",
            self.name,
            self.metric_type.as_str(),
            self.description
        )
    }
}

/// Registers the description of every metric with the installed recorder.
pub fn describe_metrics(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

#[macro_export]
macro_rules! counter {
    ($def:expr $(, $label:expr => $value:expr)* $(,)?) => {
        metrics::counter!($def.name $(, $label => $value)*)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr $(, $label:expr => $value:expr)* $(,)?) => {
        metrics::gauge!($def.name $(, $label => $value)*)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr $(, $label:expr => $value:expr)* $(,)?) => {
        metrics::histogram!($def.name $(, $label => $value)*)
    };
}
