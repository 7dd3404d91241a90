use metrics::{counter, gauge};

pub fn bundle_received(task_count: usize) {
    counter!("grid_driver_bundles_received_total").increment(1);
    counter!("grid_driver_tasks_received_total").increment(task_count as u64);
}

pub fn bundle_rejected() {
    counter!("grid_driver_bundles_rejected_total").increment(1);
}

pub fn node_dispatched(node_uuid: &str, task_count: usize) {
    counter!("grid_driver_dispatches_total", "node" => node_uuid.to_string()).increment(1);
    counter!("grid_driver_tasks_dispatched_total").increment(task_count as u64);
}

pub fn node_dispatch_failed() {
    counter!("grid_driver_dispatch_failures_total").increment(1);
}

pub fn node_count(count: usize) {
    gauge!("grid_driver_nodes").set(count as f64);
}

pub fn job_count(count: usize) {
    gauge!("grid_driver_jobs").set(count as f64);
}
