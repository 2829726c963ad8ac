//! Metric instrument factories for queuelite.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without one installed, instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("queuelite")
}

/// Counter: storage operations.
/// Labels: `operation` ("enqueue" | "claim" | "claim_conflict" | "delete" | "abort" | "recover").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("queuelite.queue.operations")
        .with_description("Number of queue storage operations")
        .build()
}

/// Counter: handler invocations.
/// Labels: `outcome` ("success" | "retry" | "abort").
pub fn delivery_attempts() -> Counter<u64> {
    meter()
        .u64_counter("queuelite.delivery.attempts")
        .with_description("Number of handler invocations by outcome")
        .build()
}

/// Histogram: handler invocation duration in milliseconds.
/// Labels: `outcome`.
pub fn delivery_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("queuelite.delivery.duration_ms")
        .with_description("Handler invocation duration in milliseconds")
        .with_unit("ms")
        .build()
}
