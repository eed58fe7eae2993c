use std::collections::HashMap;
use std::sync::LazyLock;

use super::types::TaskStatus;

static STATE_TRANSITION_MAP: LazyLock<HashMap<TaskStatus, Vec<TaskStatus>>> =
    LazyLock::new(|| {
        let mut map = HashMap::new();
        map.insert(TaskStatus::Pending, vec![TaskStatus::ImagePull]);
        map.insert(TaskStatus::ImagePull, vec![TaskStatus::Creating]);
        map.insert(TaskStatus::Creating, vec![TaskStatus::Starting]);
        map.insert(
            TaskStatus::Starting,
            vec![TaskStatus::Running, TaskStatus::Exited, TaskStatus::Crashed],
        );
        map.insert(
            TaskStatus::Running,
            vec![
                TaskStatus::Exited,
                TaskStatus::Crashed,
                TaskStatus::Suspended,
            ],
        );
        map.insert(
            TaskStatus::Suspended,
            vec![TaskStatus::Running, TaskStatus::Exited],
        );
        map.insert(TaskStatus::Exited, vec![TaskStatus::Running]);
        map.insert(TaskStatus::Crashed, vec![TaskStatus::Running]);
        map
    });

/// Staying in the same state is always allowed so repeated writes are harmless.
pub fn valid_state_transition(src: &TaskStatus, dst: &TaskStatus) -> bool {
    if src == dst {
        return true;
    }

    STATE_TRANSITION_MAP
        .get(src)
        .is_some_and(|valid_states| valid_states.contains(dst))
}

/// Maps the runtime's human readable container status onto a task status.
///
/// Only a freshly created container and an exited one are recognised. Running,
/// paused and restarting containers return `None` and are left alone.
pub fn status_from_runtime(runtime_status: &str) -> Option<TaskStatus> {
    if runtime_status == "Created" {
        return Some(TaskStatus::Starting);
    }

    if runtime_status.starts_with("Exited") {
        return Some(TaskStatus::Exited);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_path_is_valid() {
        let path = [
            TaskStatus::Pending,
            TaskStatus::ImagePull,
            TaskStatus::Creating,
            TaskStatus::Starting,
            TaskStatus::Running,
            TaskStatus::Suspended,
            TaskStatus::Running,
            TaskStatus::Exited,
        ];
        for pair in path.windows(2) {
            assert!(
                valid_state_transition(&pair[0], &pair[1]),
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn skipping_stages_is_rejected() {
        assert!(!valid_state_transition(
            &TaskStatus::Pending,
            &TaskStatus::Running
        ));
        assert!(!valid_state_transition(
            &TaskStatus::Exited,
            &TaskStatus::Suspended
        ));
        assert!(!valid_state_transition(
            &TaskStatus::Running,
            &TaskStatus::Pending
        ));
    }

    #[test]
    fn self_transitions_are_allowed() {
        assert!(valid_state_transition(
            &TaskStatus::Running,
            &TaskStatus::Running
        ));
    }

    #[test]
    fn only_created_and_exited_are_mapped() {
        assert_eq!(status_from_runtime("Created"), Some(TaskStatus::Starting));
        assert_eq!(
            status_from_runtime("Exited (0) 3 seconds ago"),
            Some(TaskStatus::Exited)
        );
        assert_eq!(status_from_runtime("Exited (137)"), Some(TaskStatus::Exited));
        assert_eq!(status_from_runtime("Up 5 minutes"), None);
        assert_eq!(status_from_runtime("Up 5 minutes (Paused)"), None);
        assert_eq!(status_from_runtime("Restarting (1) 2 seconds ago"), None);
    }
}
