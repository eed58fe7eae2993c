use sysinfo::System;

use crate::lib::store::task_store::TaskStore;
use crate::lib::worker::types::{HostCapacity, SystemMetrics};

impl HostCapacity {
    pub fn new(total_cpu: usize, total_mem: u64) -> Self {
        HostCapacity {
            total_cpu,
            total_mem,
        }
    }

    /// Host numbers are read once at startup and treated as static.
    pub fn detect() -> Self {
        let mut sysinfo = System::new();
        sysinfo.refresh_cpu_all();
        sysinfo.refresh_memory();

        let total_cpu = match sysinfo.cpus().len() {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };

        HostCapacity::new(total_cpu, sysinfo.total_memory())
    }
}

/// Combines the static host capacity with what the stored tasks have reserved.
pub fn get_system_metrics(capacity: &HostCapacity, store: &TaskStore) -> SystemMetrics {
    let agg = store.agg_metrics();

    SystemMetrics {
        total_cpu: capacity.total_cpu,
        total_mem: capacity.total_mem,
        total_tasks: agg.total_tasks,
        allocated_cpu: agg.allocated_cpu,
        allocated_mem: agg.allocated_mem,
        available_cpu: capacity.total_cpu as f64 - agg.allocated_cpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::types::TaskDefinition;

    #[test]
    fn creating_a_task_consumes_available_cpu() {
        let store = TaskStore::open_in_memory().unwrap();
        let capacity = HostCapacity::new(4, 8 << 30);

        let before = get_system_metrics(&capacity, &store);
        assert_eq!(before.total_cpu, 4);
        assert_eq!(before.available_cpu, 4.0);

        store
            .create_task(&TaskDefinition {
                image: "library/ubuntu:latest".into(),
                cpu: Some(0.5),
                ..Default::default()
            })
            .unwrap();

        let after = get_system_metrics(&capacity, &store);
        assert_eq!(after.available_cpu, 3.5);
        assert_eq!(after.allocated_cpu, 0.5);
        assert_eq!(after.total_tasks, 1);
    }

    #[test]
    fn detected_host_has_cpus() {
        assert!(HostCapacity::detect().total_cpu >= 1);
    }
}
