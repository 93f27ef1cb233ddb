//! The WKI dispatcher: frame ingress, subsystem wiring, and periodic
//! maintenance. Every other `wki-*` crate is peer-agnostic and does no wire
//! I/O of its own; this crate is where they're wired to an actual
//! [`wki_transport::Transport`] and driven by the embedding kernel's clock.
//!
//! Embedding contract:
//! 1. Call [`state::init`] once at boot, after every collaborator in
//!    `wki_lib::collab` has been registered.
//! 2. Register [`dispatch::on_frame_received`] with the transport's
//!    `set_rx_handler`.
//! 3. Call [`tick::timer_tick`] once per [`wki_lib::config::TIMER_TICK_INTERVAL_MS`].
//! 4. Call [`dispatch::on_local_task_exit`] when a process placed on behalf
//!    of a remote origin terminates.
//! 5. Call [`dispatch::try_remote_placement`] when the scheduler's
//!    `wki_lib::collab::TaskScheduler::try_remote_placement` signal says
//!    local placement is infeasible, to actually hand the task to a peer.

#![no_std]

extern crate alloc;

pub mod dispatch;
pub mod fence;
pub mod state;
pub mod tick;

pub use dispatch::{on_frame_received, on_local_task_exit, try_remote_placement};
pub use state::{init, state};
pub use tick::timer_tick;
