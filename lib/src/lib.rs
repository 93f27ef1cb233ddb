#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod alignment;
pub mod clock;
pub mod collab;
pub mod config;
pub mod klog;
pub mod once_lock;
pub mod preempt;
pub mod ring_buffer;
pub mod spinlock;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_u64, align_down_usize, align_up_u64, align_up_usize};
pub use alignment::{align_down_usize as align_down, align_up_usize as align_up};
pub use clock::{monotonic_ns, uptime_ms};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_is_enabled, klog_register_backend, klog_set_level,
};
pub use once_lock::OnceLock;
pub use preempt::{IrqPreemptGuard, PreemptGuard, is_preemption_disabled};
pub use ring_buffer::RingBuffer;
pub use spinlock::{IrqMutex, IrqMutexGuard, IrqRwLock, IrqRwLockReadGuard, IrqRwLockWriteGuard};
