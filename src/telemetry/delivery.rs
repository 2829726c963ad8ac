//! Delivery span helpers.
//!
//! One span covers the whole dispatch chain of a claimed message; each
//! handler invocation inside it is recorded as an event.

use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;
use crate::model::{MessageId, Outcome};

/// Start a span for a claimed message.
///
/// `delivery.attempts` is declared empty and filled in by [`record_outcome`].
pub fn start_delivery_span(message_id: &MessageId, consumer_id: &str) -> Span {
    tracing::info_span!(
        "queue.deliver",
        "message.id" = %message_id,
        "message.priority" = message_id.priority().get(),
        "consumer.id" = consumer_id,
        "delivery.attempts" = tracing::field::Empty,
    )
}

/// Record one handler invocation on the span and in the delivery metrics.
pub fn record_outcome(span: &Span, attempt_count: u32, outcome: &Outcome, elapsed: Duration) {
    let label = outcome.label();
    let duration_ms = elapsed.as_secs_f64() * 1000.0;

    span.record("delivery.attempts", attempt_count + 1);
    span.in_scope(|| match outcome {
        Outcome::Success => tracing::info!(attempt = attempt_count, duration_ms, "handler succeeded"),
        Outcome::Retry(reason) => {
            tracing::warn!(attempt = attempt_count, duration_ms, %reason, "handler failed, retrying")
        }
        Outcome::Abort(reason) => {
            tracing::warn!(attempt = attempt_count, duration_ms, %reason, "handler aborted message")
        }
    });

    let labels = [KeyValue::new("outcome", label)];
    metrics::delivery_attempts().add(1, &labels);
    metrics::delivery_duration_ms().record(duration_ms, &labels);
}
