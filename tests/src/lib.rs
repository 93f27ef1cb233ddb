//! Cross-crate scenario coverage for the fabric, exercised end to end
//! through the actual subsystem engines (`wki-peer`, `wki-channel`,
//! `wki-devserver`/`wki-devproxy`, `wki-eventbus`, `wki-zones`) wired
//! together by hand the same way `wki-core`'s dispatcher wires them, rather
//! than through `wki-core` itself: `WkiState` is a process-wide singleton,
//! so a test binary that needs two independent nodes in one process has to
//! hold its two sides as plain local values instead.

#![no_std]

#[cfg(test)]
extern crate alloc;
#[cfg(test)]
extern crate std;

#[cfg(test)]
mod hello_scenarios;
#[cfg(test)]
mod fencing_scenarios;
#[cfg(test)]
mod block_remote_scenarios;
#[cfg(test)]
mod eventbus_scenarios;
#[cfg(test)]
mod zone_scenarios;
#[cfg(test)]
mod compute_scenarios;
