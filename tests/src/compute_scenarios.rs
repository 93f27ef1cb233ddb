//! Remote compute submission (spec §4.K): a submitter's [`TaskClient`]
//! tracks a task placed on a remote [`TaskServer`], which runs it through a
//! fake [`TaskScheduler`] and later reports completion via `handle_exit`.

use wki_abi::payload::{TaskCompletePayload, TaskRejectReason};
use wki_abi::NodeId;
use wki_compute::{SubmitPoll, TaskClient, TaskServer, WaitPoll};
use wki_lib::collab::TaskScheduler;

struct AcceptingScheduler;

impl TaskScheduler for AcceptingScheduler {
    fn spawn_kthread(&self, _entry: fn(), _name: &str) -> bool {
        true
    }
    fn place_process(&self, _binary: &[u8], _args: &[u8]) -> Option<u64> {
        Some(4242)
    }
    fn try_remote_placement(&self) -> bool {
        false
    }
}

struct FullScheduler;

impl TaskScheduler for FullScheduler {
    fn spawn_kthread(&self, _entry: fn(), _name: &str) -> bool {
        true
    }
    fn place_process(&self, _binary: &[u8], _args: &[u8]) -> Option<u64> {
        None
    }
    fn try_remote_placement(&self) -> bool {
        false
    }
}

#[test]
fn submit_runs_to_completion_and_reports_output() {
    let client = TaskClient::new();
    let server = TaskServer::new();
    let submitter = NodeId(1);
    let server_node = NodeId(2);
    let task_id = 7;

    assert!(client.begin_submit(server_node, task_id, 0));

    let resp = server.handle_submit(submitter, task_id, b"echo-binary", b"--flag", &AcceptingScheduler);
    assert_eq!(resp.status, TaskRejectReason::Accepted as u8);
    assert_eq!(resp.remote_pid, 4242);

    client.on_response(server_node, &resp);
    assert!(matches!(client.poll_submit(server_node, task_id, 0), SubmitPoll::Accepted { remote_pid: 4242 }));

    let exited = server.handle_exit(submitter, task_id, 0, b"ok");
    let (done_task_id, exit_status, output) = exited.expect("task was tracked server-side");
    assert_eq!(done_task_id, task_id);
    assert_eq!(exit_status, 0);
    assert_eq!(output, b"ok");

    let complete = TaskCompletePayload { task_id, exit_status, output: &output };
    client.on_complete(server_node, &complete);
    match client.poll_wait(server_node, task_id) {
        WaitPoll::Complete { exit_status, output } => {
            assert_eq!(exit_status, 0);
            assert_eq!(output, b"ok");
        }
        other => panic!("expected Complete, got {other:?}"),
    }
}

#[test]
fn submit_rejected_when_scheduler_has_no_capacity() {
    let server = TaskServer::new();
    let resp = server.handle_submit(NodeId(1), 1, b"binary", b"", &FullScheduler);
    assert_eq!(resp.status, TaskRejectReason::NoCapacity as u8);
    assert_eq!(resp.remote_pid, 0);
}

#[test]
fn duplicate_submit_for_same_task_is_rejected() {
    let server = TaskServer::new();
    let first = server.handle_submit(NodeId(1), 1, b"binary", b"", &AcceptingScheduler);
    assert_eq!(first.status, TaskRejectReason::Accepted as u8);

    let second = server.handle_submit(NodeId(1), 1, b"binary", b"", &AcceptingScheduler);
    assert_eq!(second.status, TaskRejectReason::NoCapacity as u8);
}
