//! Remote task submission and load reporting (spec §4.K).
//!
//! `TaskClient` tracks tasks this node has submitted to a remote peer;
//! `TaskServer` tracks tasks a remote peer has submitted to us; and
//! `LoadReportCache` is the recency-bounded per-node load table the
//! scheduler placement hook consults. All three are independent tables —
//! a node can be both a submitter and a server for different tasks at
//! once — mirroring the devserver/devproxy split for device remoting.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use wki_abi::payload::{LoadReportPayload, TaskCancelPayload, TaskCompletePayload, TaskRejectReason, TaskResponsePayload};
use wki_abi::NodeId;
use wki_lib::collab::TaskScheduler;
use wki_lib::config::{ATTACH_TIMEOUT_MS, LOAD_REPORT_STALE_MS, MAX_PEERS, MAX_REMOTE_TASKS, REMOTE_PLACEMENT_PENALTY, TASK_OUTPUT_MAX};
use wki_lib::IrqMutex;

/// Distinguished exit status for a submitted task whose remote peer was
/// fenced before completion. Deliberately distinct from the server's
/// force-kill status (`-9`, spec.md's `cancel` result) since the process
/// may still be running on a now-unreachable node.
pub const TASK_EXIT_PEER_FENCED: i32 = -2;
/// Exit status a server-side `cancel` completes with (spec.md §4.K).
pub const TASK_EXIT_CANCELLED: i32 = -9;

// ---------------------------------------------------------------------
// Client side: tasks we submitted to a remote peer.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum SubmitPhase {
    AwaitingResponse { started_ns: u64 },
    Running { remote_pid: u64 },
    Complete { exit_status: i32, output: Vec<u8> },
    Rejected(TaskRejectReason),
}

#[derive(Debug, Clone)]
struct PendingSubmit {
    target: NodeId,
    task_id: u32,
    phase: SubmitPhase,
}

/// Progress of a task this node submitted, per [`TaskClient::poll_submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPoll {
    Pending,
    Accepted { remote_pid: u64 },
    Rejected(TaskRejectReason),
    TimedOut,
}

/// Progress of a task's exit, per [`TaskClient::poll_wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitPoll {
    Running,
    Complete { exit_status: i32, output: Vec<u8> },
    Unknown,
}

pub struct TaskClient {
    tasks: [IrqMutex<Option<PendingSubmit>>; MAX_REMOTE_TASKS],
    table_lock: IrqMutex<()>,
}

impl TaskClient {
    pub fn new() -> Self {
        Self {
            tasks: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn find_index(&self, target: NodeId, task_id: u32) -> Option<usize> {
        self.tasks
            .iter()
            .position(|slot| slot.lock().as_ref().is_some_and(|t| t.target == target && t.task_id == task_id))
    }

    /// Reserve a slot for a new submission; the caller builds and sends
    /// the `TASK_SUBMIT` itself. `false` if `task_id` is already in use
    /// against `target` or the table is full.
    pub fn begin_submit(&self, target: NodeId, task_id: u32, now_ns: u64) -> bool {
        let _guard = self.table_lock.lock();
        if self.find_index(target, task_id).is_some() {
            return false;
        }
        for slot in &self.tasks {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(PendingSubmit { target, task_id, phase: SubmitPhase::AwaitingResponse { started_ns: now_ns } });
                return true;
            }
        }
        false
    }

    /// Apply a `TASK_ACCEPT`/`TASK_REJECT` (both carried on
    /// `TaskResponsePayload`, distinguished by `status`).
    pub fn on_response(&self, target: NodeId, resp: &TaskResponsePayload) {
        let Some(idx) = self.find_index(target, resp.task_id) else { return };
        let mut guard = self.tasks[idx].lock();
        if let Some(t) = guard.as_mut() {
            t.phase = if resp.status == TaskRejectReason::Accepted as u8 {
                SubmitPhase::Running { remote_pid: resp.remote_pid }
            } else {
                SubmitPhase::Rejected(reject_reason_from_u8(resp.status))
            };
        }
    }

    /// Apply a `TASK_COMPLETE` for a task this node is waiting on.
    pub fn on_complete(&self, target: NodeId, complete: &TaskCompletePayload<'_>) {
        let Some(idx) = self.find_index(target, complete.task_id) else { return };
        let mut guard = self.tasks[idx].lock();
        if let Some(t) = guard.as_mut() {
            t.phase = SubmitPhase::Complete { exit_status: complete.exit_status, output: complete.output.to_vec() };
        }
    }

    /// Spin-wait poll for the submit handshake outcome, per spec.md's
    /// "spin-waits for TASK_ACCEPT or TASK_REJECT". Frees the slot on
    /// timeout.
    pub fn poll_submit(&self, target: NodeId, task_id: u32, now_ns: u64) -> SubmitPoll {
        let Some(idx) = self.find_index(target, task_id) else { return SubmitPoll::TimedOut };
        let mut guard = self.tasks[idx].lock();
        match guard.as_ref().map(|t| t.phase.clone()) {
            Some(SubmitPhase::Running { remote_pid }) => SubmitPoll::Accepted { remote_pid },
            Some(SubmitPhase::Rejected(reason)) => {
                *guard = None;
                SubmitPoll::Rejected(reason)
            }
            Some(SubmitPhase::AwaitingResponse { started_ns }) => {
                if now_ns.saturating_sub(started_ns) >= ATTACH_TIMEOUT_MS * 1_000_000 {
                    *guard = None;
                    SubmitPoll::TimedOut
                } else {
                    SubmitPoll::Pending
                }
            }
            Some(SubmitPhase::Complete { .. }) | None => SubmitPoll::TimedOut,
        }
    }

    /// Spin-wait poll for `wait(task_id)`. Frees the slot once the exit
    /// status has been delivered.
    pub fn poll_wait(&self, target: NodeId, task_id: u32) -> WaitPoll {
        let Some(idx) = self.find_index(target, task_id) else { return WaitPoll::Unknown };
        let mut guard = self.tasks[idx].lock();
        match guard.as_ref().map(|t| t.phase.clone()) {
            Some(SubmitPhase::Complete { exit_status, output }) => {
                *guard = None;
                WaitPoll::Complete { exit_status, output }
            }
            Some(SubmitPhase::Running { .. }) => WaitPoll::Running,
            _ => WaitPoll::Unknown,
        }
    }

    /// Build the `TASK_CANCEL` to send for a running task.
    pub fn cancel(&self, target: NodeId, task_id: u32) -> Option<TaskCancelPayload> {
        let idx = self.find_index(target, task_id)?;
        let guard = self.tasks[idx].lock();
        match guard.as_ref()?.phase {
            SubmitPhase::Running { .. } => Some(TaskCancelPayload { task_id }),
            _ => None,
        }
    }

    /// Peer fencing: every task still waiting on `node` is unblocked with
    /// [`TASK_EXIT_PEER_FENCED`] rather than left to time out (spec.md §5:
    /// "fencing is the universal abort").
    pub fn fence_peer(&self, node: NodeId) -> Vec<u32> {
        let mut unblocked = Vec::new();
        for slot in &self.tasks {
            let mut guard = slot.lock();
            if let Some(t) = guard.as_mut() {
                if t.target == node && !matches!(t.phase, SubmitPhase::Complete { .. }) {
                    t.phase = SubmitPhase::Complete { exit_status: TASK_EXIT_PEER_FENCED, output: Vec::new() };
                    unblocked.push(t.task_id);
                }
            }
        }
        unblocked
    }
}

impl Default for TaskClient {
    fn default() -> Self {
        Self::new()
    }
}

fn reject_reason_from_u8(v: u8) -> TaskRejectReason {
    match v {
        1 => TaskRejectReason::NoCapacity,
        2 => TaskRejectReason::BinaryTooLarge,
        3 => TaskRejectReason::PathNotFound,
        4 => TaskRejectReason::PermissionDenied,
        _ => TaskRejectReason::Accepted,
    }
}

// ---------------------------------------------------------------------
// Server side: tasks a remote peer submitted to us.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RemoteTask {
    origin: NodeId,
    task_id: u32,
    remote_pid: u64,
}

/// Info the caller needs to send `TASK_COMPLETE` after a force-kill.
#[derive(Debug, Clone, Copy)]
pub struct TaskKilled {
    pub task_id: u32,
    pub remote_pid: u64,
}

pub struct TaskServer {
    tasks: [IrqMutex<Option<RemoteTask>>; MAX_REMOTE_TASKS],
    table_lock: IrqMutex<()>,
}

impl TaskServer {
    pub fn new() -> Self {
        Self {
            tasks: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn find_index(&self, origin: NodeId, task_id: u32) -> Option<usize> {
        self.tasks
            .iter()
            .position(|slot| slot.lock().as_ref().is_some_and(|t| t.origin == origin && t.task_id == task_id))
    }

    /// Handle an inbound `TASK_SUBMIT` whose binary has already been
    /// resolved to bytes by the caller (VFS-ref/resource-ref delivery
    /// modes are fetched upstream of this crate, same as devserver
    /// assumes a resource is already looked up before dispatch). Places
    /// the process via the scheduler collaborator and returns the
    /// `TASK_ACCEPT`/`TASK_REJECT` to send.
    pub fn handle_submit(&self, origin: NodeId, task_id: u32, binary: &[u8], args: &[u8], scheduler: &dyn TaskScheduler) -> TaskResponsePayload {
        let _guard = self.table_lock.lock();
        if self.find_index(origin, task_id).is_some() {
            return TaskResponsePayload { task_id, status: TaskRejectReason::NoCapacity as u8, remote_pid: 0 };
        }
        let Some(remote_pid) = scheduler.place_process(binary, args) else {
            return TaskResponsePayload { task_id, status: TaskRejectReason::NoCapacity as u8, remote_pid: 0 };
        };
        for slot in &self.tasks {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(RemoteTask { origin, task_id, remote_pid });
                return TaskResponsePayload { task_id, status: TaskRejectReason::Accepted as u8, remote_pid };
            }
        }
        TaskResponsePayload { task_id, status: TaskRejectReason::NoCapacity as u8, remote_pid: 0 }
    }

    /// The embedding kernel's process-exit notification arrives here;
    /// builds the `TASK_COMPLETE` to send and frees the slot.
    pub fn handle_exit(&self, origin: NodeId, task_id: u32, exit_status: i32, output: &[u8]) -> Option<(u32, i32, Vec<u8>)> {
        let idx = self.find_index(origin, task_id)?;
        self.tasks[idx].lock().take()?;
        let clamped = &output[..output.len().min(TASK_OUTPUT_MAX)];
        Some((task_id, exit_status, clamped.to_vec()))
    }

    /// Handle an inbound `TASK_CANCEL`: frees the slot and hands back the
    /// remote pid so the caller can force-kill it and send
    /// `TASK_COMPLETE{exit_status: TASK_EXIT_CANCELLED}`. There is no
    /// collaborator hook to force-kill a process directly — the
    /// embedding kernel's process subsystem owns that, same as devserver
    /// never performs the underlying block/NIC I/O itself.
    pub fn handle_cancel(&self, origin: NodeId, task_id: u32) -> Option<TaskKilled> {
        let idx = self.find_index(origin, task_id)?;
        let task = self.tasks[idx].lock().take()?;
        Some(TaskKilled { task_id: task.task_id, remote_pid: task.remote_pid })
    }

    /// Peer fencing: every task submitted by `node` is handed back for a
    /// local force-kill (the origin is gone, so no `TASK_COMPLETE` is
    /// sent).
    pub fn fence_origin(&self, node: NodeId) -> Vec<TaskKilled> {
        let mut killed = Vec::new();
        for slot in &self.tasks {
            let taken = {
                let mut guard = slot.lock();
                if guard.is_some_and(|t| t.origin == node) {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some(task) = taken {
                killed.push(TaskKilled { task_id: task.task_id, remote_pid: task.remote_pid });
            }
        }
        killed
    }
}

impl Default for TaskServer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Load reporting and remote-placement cache.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct LoadReportEntry {
    node: NodeId,
    num_cpus: u16,
    runnable_tasks: u16,
    avg_load_pct: u16,
    free_mem_pages: u16,
    received_ms: u64,
}

/// Per-node recency-bounded cache of the last `LOAD_REPORT` broadcast,
/// consulted by the scheduler's `try_remote_placement` hook.
pub struct LoadReportCache {
    entries: [IrqMutex<Option<LoadReportEntry>>; MAX_PEERS],
    table_lock: IrqMutex<()>,
}

impl LoadReportCache {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn find_index(&self, node: NodeId) -> Option<usize> {
        self.entries.iter().position(|slot| slot.lock().as_ref().is_some_and(|e| e.node == node))
    }

    pub fn record(&self, node: NodeId, report: &LoadReportPayload<'_>, now_ms: u64) {
        let entry = LoadReportEntry {
            node,
            num_cpus: report.num_cpus(),
            runnable_tasks: report.runnable_tasks,
            avg_load_pct: report.avg_load_pct,
            free_mem_pages: report.free_mem_pages,
            received_ms: now_ms,
        };
        let _guard = self.table_lock.lock();
        if let Some(idx) = self.find_index(node) {
            *self.entries[idx].lock() = Some(entry);
            return;
        }
        for slot in &self.entries {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(entry);
                return;
            }
        }
    }

    /// Find the least-loaded node with a recent report, and only return
    /// it if remote placement is actually worth the round trip: its
    /// reported load plus [`REMOTE_PLACEMENT_PENALTY`] must still beat
    /// `local_load_pct`.
    pub fn least_loaded_node(&self, local_load_pct: u16, now_ms: u64) -> Option<NodeId> {
        let mut best: Option<(NodeId, u16)> = None;
        for slot in &self.entries {
            let guard = slot.lock();
            let Some(entry) = guard.as_ref() else { continue };
            if now_ms.saturating_sub(entry.received_ms) >= LOAD_REPORT_STALE_MS {
                continue;
            }
            let better = match best {
                Some((_, load)) => entry.avg_load_pct < load,
                None => true,
            };
            if better {
                best = Some((entry.node, entry.avg_load_pct));
            }
        }
        let (node, load) = best?;
        if load + REMOTE_PLACEMENT_PENALTY < local_load_pct {
            Some(node)
        } else {
            None
        }
    }

    pub fn fence_peer(&self, node: NodeId) {
        if let Some(idx) = self.find_index(node) {
            *self.entries[idx].lock() = None;
        }
    }
}

impl Default for LoadReportCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeScheduler {
        accept: bool,
    }

    impl TaskScheduler for FakeScheduler {
        fn spawn_kthread(&self, _entry: fn(), _name: &str) -> bool {
            true
        }
        fn place_process(&self, _binary: &[u8], _args: &[u8]) -> Option<u64> {
            if self.accept {
                Some(4242)
            } else {
                None
            }
        }
        fn try_remote_placement(&self) -> bool {
            false
        }
    }

    #[test]
    fn submit_round_trip_reaches_running_then_complete() {
        let client = TaskClient::new();
        assert!(client.begin_submit(NodeId(2), 1, 0));
        assert_eq!(client.poll_submit(NodeId(2), 1, 0), SubmitPoll::Pending);

        client.on_response(NodeId(2), &TaskResponsePayload { task_id: 1, status: TaskRejectReason::Accepted as u8, remote_pid: 99 });
        assert_eq!(client.poll_submit(NodeId(2), 1, 0), SubmitPoll::Accepted { remote_pid: 99 });

        client.on_complete(NodeId(2), &TaskCompletePayload { task_id: 1, exit_status: 0, output: b"ok" });
        assert_eq!(client.poll_wait(NodeId(2), 1), WaitPoll::Complete { exit_status: 0, output: b"ok".to_vec() });
        assert_eq!(client.poll_wait(NodeId(2), 1), WaitPoll::Unknown);
    }

    #[test]
    fn submit_times_out_without_a_response() {
        let client = TaskClient::new();
        client.begin_submit(NodeId(2), 1, 0);
        assert_eq!(client.poll_submit(NodeId(2), 1, ATTACH_TIMEOUT_MS * 1_000_000), SubmitPoll::TimedOut);
        assert_eq!(client.poll_submit(NodeId(2), 1, 0), SubmitPoll::TimedOut);
    }

    #[test]
    fn fencing_unblocks_waiting_tasks_with_fenced_status() {
        let client = TaskClient::new();
        client.begin_submit(NodeId(2), 1, 0);
        client.on_response(NodeId(2), &TaskResponsePayload { task_id: 1, status: TaskRejectReason::Accepted as u8, remote_pid: 7 });
        let unblocked = client.fence_peer(NodeId(2));
        assert_eq!(unblocked, alloc::vec![1]);
        assert_eq!(client.poll_wait(NodeId(2), 1), WaitPoll::Complete { exit_status: TASK_EXIT_PEER_FENCED, output: Vec::new() });
    }

    #[test]
    fn server_accepts_and_places_then_reports_exit() {
        let server = TaskServer::new();
        let scheduler = FakeScheduler { accept: true };
        let resp = server.handle_submit(NodeId(1), 5, b"\x7fELF", b"", &scheduler);
        assert_eq!(resp.status, TaskRejectReason::Accepted as u8);
        assert_eq!(resp.remote_pid, 4242);

        let (task_id, status, output) = server.handle_exit(NodeId(1), 5, 0, b"done").unwrap();
        assert_eq!(task_id, 5);
        assert_eq!(status, 0);
        assert_eq!(output, b"done");
    }

    #[test]
    fn server_rejects_when_scheduler_has_no_capacity() {
        let server = TaskServer::new();
        let scheduler = FakeScheduler { accept: false };
        let resp = server.handle_submit(NodeId(1), 5, b"\x7fELF", b"", &scheduler);
        assert_eq!(resp.status, TaskRejectReason::NoCapacity as u8);
    }

    #[test]
    fn server_cancel_returns_remote_pid_for_force_kill() {
        let server = TaskServer::new();
        let scheduler = FakeScheduler { accept: true };
        server.handle_submit(NodeId(1), 5, b"bin", b"", &scheduler);
        let killed = server.handle_cancel(NodeId(1), 5).unwrap();
        assert_eq!(killed.remote_pid, 4242);
        assert!(server.handle_cancel(NodeId(1), 5).is_none());
    }

    #[test]
    fn least_loaded_node_requires_recency_and_penalty_margin() {
        let cache = LoadReportCache::new();
        let mut buf = [0u8; 10];
        LoadReportPayload::encode_prefix(&mut buf, 1, 2, 100, 4096);
        let report = LoadReportPayload::decode(&buf).unwrap();
        cache.record(NodeId(2), &report, 1_000);

        assert_eq!(cache.least_loaded_node(500, 1_100), Some(NodeId(2)));
        assert_eq!(cache.least_loaded_node(250, 1_100), None);
        assert_eq!(cache.least_loaded_node(500, 1_100 + LOAD_REPORT_STALE_MS), None);
    }

    #[test]
    fn fence_peer_drops_its_load_report() {
        let cache = LoadReportCache::new();
        let mut buf = [0u8; 8];
        LoadReportPayload::encode_prefix(&mut buf, 0, 2, 100, 4096);
        let report = LoadReportPayload::decode(&buf).unwrap();
        cache.record(NodeId(2), &report, 0);
        cache.fence_peer(NodeId(2));
        assert_eq!(cache.least_loaded_node(1000, 0), None);
    }
}
