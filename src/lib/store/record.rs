use uuid::Uuid;

use crate::lib::tasks::types::{Task, TaskError, TaskResult, TaskStatus};

/// A task as it sits in the `tasks` collection: the authoritative status
/// column next to the JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub body: Vec<u8>,
}

impl TaskRecord {
    pub fn encode(task: &Task) -> TaskResult<Self> {
        let body = serde_json::to_vec(task).map_err(|err| TaskError::CorruptRecord {
            id: task.id,
            reason: format!("encode: {}", err),
        })?;

        Ok(TaskRecord {
            status: task.status,
            body,
        })
    }

    pub fn decode(id: Uuid, raw_status: i64, body: &[u8]) -> TaskResult<Task> {
        if body.is_empty() {
            return Err(TaskError::EmptyRecord(id));
        }

        let status = TaskStatus::from_i64(raw_status).ok_or_else(|| TaskError::CorruptRecord {
            id,
            reason: format!("unknown status {}", raw_status),
        })?;

        let mut task: Task = serde_json::from_slice(body).map_err(|err| {
            TaskError::CorruptRecord {
                id,
                reason: err.to_string(),
            }
        })?;

        if task.id != id {
            return Err(TaskError::CorruptRecord {
                id,
                reason: format!("body belongs to task {}", task.id),
            });
        }

        task.status = status;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::types::TaskDefinition;
    use chrono::Utc;

    fn running_task() -> Task {
        let mut task = Task::new(&TaskDefinition {
            app_name: "api".into(),
            deployment_name: "prod".into(),
            stack_name: "shop".into(),
            image: "ghcr.io/acme/api:1.4".into(),
            cpu: Some(0.25),
            memory: Some(128 << 20),
            exposed_ports: vec![8080],
        })
        .unwrap();
        task.container_id = Some("c0ffee".into());
        task.started_at = Some(Utc::now());
        task.host_port_bindings.insert(49160, 8080);
        task.host_port_bindings.insert(49153, 9090);
        task
    }

    #[test]
    fn reencoding_a_decoded_record_is_byte_identical() {
        let statuses = [
            TaskStatus::Pending,
            TaskStatus::ImagePull,
            TaskStatus::Creating,
            TaskStatus::Starting,
            TaskStatus::Running,
            TaskStatus::Suspended,
            TaskStatus::Exited,
            TaskStatus::Crashed,
        ];

        for status in statuses {
            let mut task = running_task();
            task.status = status;
            let record = TaskRecord::encode(&task).unwrap();

            let decoded = TaskRecord::decode(task.id, record.status.as_i64(), &record.body).unwrap();
            let reencoded = TaskRecord::encode(&decoded).unwrap();

            assert_eq!(decoded, task);
            assert_eq!(reencoded, record);
        }
    }

    #[test]
    fn arbitrary_cpu_values_survive_reencoding() {
        let mut task = running_task();
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut values = vec![0.1, 1.0 / 3.0, 2.4191210911045706, f64::MIN_POSITIVE];

        for _ in 0..5_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            values.push((state >> 11) as f64 / (1u64 << 53) as f64 * 4.0);
        }

        for cpu in values {
            task.cpu = cpu;
            let record = TaskRecord::encode(&task).unwrap();
            let decoded = TaskRecord::decode(task.id, record.status.as_i64(), &record.body).unwrap();

            assert_eq!(decoded.cpu.to_bits(), cpu.to_bits(), "cpu {} drifted", cpu);
            assert_eq!(TaskRecord::encode(&decoded).unwrap(), record);
        }
    }

    #[test]
    fn status_column_wins_over_body() {
        let mut task = running_task();
        task.status = TaskStatus::Running;
        let record = TaskRecord::encode(&task).unwrap();

        let decoded = TaskRecord::decode(task.id, TaskStatus::Exited.as_i64(), &record.body).unwrap();
        assert_eq!(decoded.status, TaskStatus::Exited);
    }

    #[test]
    fn empty_body_is_distinct_from_corrupt() {
        let id = Uuid::now_v7();
        assert!(matches!(
            TaskRecord::decode(id, 1, b""),
            Err(TaskError::EmptyRecord(got)) if got == id
        ));
        assert!(matches!(
            TaskRecord::decode(id, 1, b"{not json"),
            Err(TaskError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn unknown_status_or_foreign_body_is_corrupt() {
        let task = running_task();
        let record = TaskRecord::encode(&task).unwrap();

        assert!(matches!(
            TaskRecord::decode(task.id, 42, &record.body),
            Err(TaskError::CorruptRecord { .. })
        ));
        assert!(matches!(
            TaskRecord::decode(Uuid::now_v7(), 1, &record.body),
            Err(TaskError::CorruptRecord { .. })
        ));
    }
}
