use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub fn bundle_dispatched(channel_uuid: &str, task_count: usize) {
    counter!("grid_bundles_dispatched_total", "channel" => channel_uuid.to_string()).increment(1);
    counter!("grid_tasks_dispatched_total").increment(task_count as u64);
}

pub fn bundle_resubmitted(task_count: usize) {
    counter!("grid_bundles_resubmitted_total").increment(1);
    counter!("grid_tasks_resubmitted_total").increment(task_count as u64);
}

pub fn dispatch_expired() {
    counter!("grid_dispatch_expirations_total").increment(1);
}

pub fn bundle_round_trip(elapsed: Duration) {
    histogram!("grid_bundle_round_trip_ms").record(elapsed.as_millis() as f64);
}

pub fn job_submitted() {
    counter!("grid_jobs_submitted_total").increment(1);
}

pub fn job_ended(cancelled: bool) {
    counter!("grid_jobs_ended_total", "cancelled" => cancelled.to_string()).increment(1);
}

pub fn queue_size(size: usize) {
    gauge!("grid_job_queue_size").set(size as f64);
}

pub fn channel_count(count: usize) {
    gauge!("grid_channels").set(count as f64);
}
