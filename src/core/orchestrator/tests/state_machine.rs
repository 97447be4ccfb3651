use crate::core::orchestrator::{RunStatus, TaskStatus, can_transition_run, can_transition_task};

#[test]
fn task_happy_path_transitions_are_allowed() {
    let path = [
        (TaskStatus::Pending, TaskStatus::Planning),
        (TaskStatus::Planning, TaskStatus::Executing),
        (TaskStatus::Executing, TaskStatus::ApprovalNeeded),
        (TaskStatus::ApprovalNeeded, TaskStatus::Executing),
        (TaskStatus::Executing, TaskStatus::Completed),
    ];
    for (from, to) in path {
        assert!(
            can_transition_task(from, to),
            "expected transition {:?} -> {:?} to be allowed",
            from,
            to
        );
    }
}

#[test]
fn any_live_task_can_fail() {
    let live = [
        TaskStatus::Pending,
        TaskStatus::Planning,
        TaskStatus::Executing,
        TaskStatus::ApprovalNeeded,
    ];
    for from in live {
        assert!(
            can_transition_task(from, TaskStatus::Failed),
            "expected failure from {:?}",
            from
        );
    }
}

#[test]
fn terminal_task_states_are_final() {
    for from in [TaskStatus::Completed, TaskStatus::Failed] {
        for to in [
            TaskStatus::Pending,
            TaskStatus::Executing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert!(!can_transition_task(from, to), "{:?} -> {:?}", from, to);
        }
    }
}

#[test]
fn task_cannot_skip_planning_or_complete_while_paused() {
    assert!(!can_transition_task(TaskStatus::Pending, TaskStatus::Executing));
    assert!(!can_transition_task(TaskStatus::ApprovalNeeded, TaskStatus::Completed));
}

#[test]
fn run_transitions_follow_the_lifecycle() {
    assert!(can_transition_run(RunStatus::Created, RunStatus::Started));
    assert!(can_transition_run(RunStatus::Started, RunStatus::WaitingApproval));
    assert!(can_transition_run(RunStatus::WaitingApproval, RunStatus::Started));
    assert!(can_transition_run(RunStatus::Created, RunStatus::Terminated));
    assert!(can_transition_run(RunStatus::WaitingApproval, RunStatus::Terminated));
    assert!(can_transition_run(RunStatus::Started, RunStatus::Terminated));

    assert!(!can_transition_run(RunStatus::Created, RunStatus::WaitingApproval));
    assert!(!can_transition_run(RunStatus::Terminated, RunStatus::Started));
    assert!(!can_transition_run(RunStatus::Terminated, RunStatus::Terminated));
}
