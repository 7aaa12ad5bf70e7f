//! Lightweight counters/gauges emitted from the dispatch loop, in the
//! spirit of `fc-router`'s `PoolMetricsCollector` but scaled down to plain
//! `metrics` crate primitives — no exporter wiring, no windowing, just the
//! counters a queue's own subsystem cares about.

use metrics::{counter, gauge};

pub fn message_published(queue: &str) {
    counter!("bq_queue_messages_published_total", "queue" => queue.to_string()).increment(1);
}

pub fn message_delivered(queue: &str) {
    counter!("bq_queue_messages_delivered_total", "queue" => queue.to_string()).increment(1);
}

pub fn message_acked(queue: &str, count: u64) {
    counter!("bq_queue_messages_acked_total", "queue" => queue.to_string()).increment(count);
}

pub fn message_redelivered(queue: &str, count: u64) {
    counter!("bq_queue_messages_redelivered_total", "queue" => queue.to_string()).increment(count);
}

pub fn buffer_depth(queue: &str, depth: u64) {
    gauge!("bq_queue_buffer_depth", "queue" => queue.to_string()).set(depth as f64);
}

pub fn blocked_consumers(queue: &str, count: u64) {
    gauge!("bq_queue_blocked_consumers", "queue" => queue.to_string()).set(count as f64);
}
