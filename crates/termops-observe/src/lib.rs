//! Observability setup for termops: structured logging with an optional
//! OpenTelemetry span exporter.

pub mod tracing_setup;
