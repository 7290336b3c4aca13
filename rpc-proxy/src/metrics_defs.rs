//! Metrics definitions for the rpc proxy.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "rpc_proxy.requests",
    metric_type: MetricType::Counter,
    description: "Gateway requests, tagged by response status",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "rpc_proxy.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to serve a gateway request in seconds",
};

pub const UPSTREAM_CALLS: MetricDef = MetricDef {
    name: "rpc_proxy.upstream.calls",
    metric_type: MetricType::Counter,
    description: "Upstream JSON-RPC calls, tagged by chain id and outcome",
};

pub const UPSTREAM_DURATION: MetricDef = MetricDef {
    name: "rpc_proxy.upstream.duration",
    metric_type: MetricType::Histogram,
    description: "Time for an upstream JSON-RPC call to complete in seconds",
};

pub const BATCH_SIZE: MetricDef = MetricDef {
    name: "rpc_proxy.batch.size",
    metric_type: MetricType::Histogram,
    description: "Number of calls in accepted batch requests",
};

pub const RATE_LIMITED: MetricDef = MetricDef {
    name: "rpc_proxy.rate_limited",
    metric_type: MetricType::Counter,
    description: "Requests rejected by the rate limiter",
};

pub const CSRF_FAILURES: MetricDef = MetricDef {
    name: "rpc_proxy.csrf.failures",
    metric_type: MetricType::Counter,
    description: "Requests with a missing or mismatched CSRF token, tagged by mode",
};

pub const RATE_LIMITER_ENTRIES: MetricDef = MetricDef {
    name: "rpc_proxy.rate_limiter.entries",
    metric_type: MetricType::Gauge,
    description: "Client identities tracked by the rate limiter after a sweep",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS,
    REQUEST_DURATION,
    UPSTREAM_CALLS,
    UPSTREAM_DURATION,
    BATCH_SIZE,
    RATE_LIMITED,
    CSRF_FAILURES,
    RATE_LIMITER_ENTRIES,
];
