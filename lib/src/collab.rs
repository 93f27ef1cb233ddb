//! External collaborator traits.
//!
//! WKI does not own interrupt control, preemption, a monotonic clock, a
//! physical page allocator, a task scheduler, or the block/NIC/VFS device
//! registries — those belong to the kernel it's embedded in. Each is a
//! trait here; the embedding kernel registers one implementation of each
//! via the `register_*` functions, normally once during its own init.
//!
//! `InterruptControl`, `PreemptControl`, and `MonotonicClock` are not named
//! by the resource-remoting contract the fabric negotiates over the wire —
//! they're the locking/timing plumbing every subsystem crate needs and
//! would otherwise have to assume a concrete architecture to get.

/// Disables/restores interrupts on the current CPU, the way `cli`/`popf`
/// would on x86 — but without this crate assuming x86.
pub trait InterruptControl: Send + Sync {
    /// Save the current interrupt state and disable interrupts. Returns an
    /// opaque token to pass to [`restore`](InterruptControl::restore).
    fn save_and_disable(&self) -> u64;
    /// Restore the interrupt state captured by a prior `save_and_disable`.
    fn restore(&self, saved: u64);
}

/// Disables/enables preemption of the current kernel thread.
pub trait PreemptControl: Send + Sync {
    fn disable(&self);
    fn enable(&self);
    /// `true` if preemption is currently disabled on this CPU.
    fn is_disabled(&self) -> bool;
}

/// Nanosecond-resolution monotonic clock, backing heartbeat/RTO timing.
pub trait MonotonicClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// The link-layer driver a transport sends frames through and receives
/// frames from.
pub trait LinkDriver: Send + Sync {
    /// Maximum payload size (excluding link-layer framing) this driver can
    /// send in one frame.
    fn mtu(&self) -> usize;
    /// Transmit `bytes` to `neighbor_mac`. Errors are transport-level
    /// (`WkiError::TxFailed`); the driver itself is assumed reliable at the
    /// link layer (CRC/FCS), WKI re-establishes reliability per-channel.
    fn send(&self, neighbor_mac: [u8; 6], bytes: &[u8]) -> wki_abi::WkiResult<()>;
    /// Install the callback invoked with each received frame's bytes. Only
    /// one callback is active at a time; a second call replaces the first.
    fn set_rx_callback(&self, callback: fn(&[u8]));
}

/// A block device reachable through a [`BlockRegistry`] lookup. Device-server
/// dispatches `BLOCK_READ/WRITE/FLUSH/INFO` straight through this.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u32;
    fn total_blocks(&self) -> u64;
    fn read(&self, lba: u64, buf: &mut [u8]) -> wki_abi::WkiResult<()>;
    fn write(&self, lba: u64, buf: &[u8]) -> wki_abi::WkiResult<()>;
    fn flush(&self) -> wki_abi::WkiResult<()>;
}

/// A NIC reachable through a [`NetRegistry`] lookup, dispatched for
/// `NET_XMIT/SET_MAC/GET_STATS`.
pub trait NetDeviceOps: Send + Sync {
    fn xmit(&self, frame: &[u8]) -> wki_abi::WkiResult<()>;
    fn set_mac(&self, mac: [u8; 6]) -> wki_abi::WkiResult<()>;
    fn stats(&self) -> NetDeviceStats;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetDeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

/// A filesystem export reachable through a [`VfsRegistry`] lookup,
/// inode-addressed the same way the teacher's own `FileSystem` trait is
/// (`lookup`/`getattr`/`read`/`write`/`create`/`unlink`/`readdir`), since
/// that's the exact op set `DeviceOp`'s `Vfs*` variants carry. `getattr`/
/// `setattr`/`readdir` write their (embedding-kernel-defined) struct/entry
/// encoding into `out` as raw bytes — WKI forwards them without
/// interpreting the layout.
pub trait VfsBackend: Send + Sync {
    fn lookup(&self, parent: u64, name: &[u8]) -> wki_abi::WkiResult<u64>;
    fn getattr(&self, inode: u64, out: &mut [u8]) -> wki_abi::WkiResult<usize>;
    fn setattr(&self, inode: u64, attr: &[u8]) -> wki_abi::WkiResult<()>;
    fn read(&self, inode: u64, offset: u64, buf: &mut [u8]) -> wki_abi::WkiResult<usize>;
    fn write(&self, inode: u64, offset: u64, buf: &[u8]) -> wki_abi::WkiResult<usize>;
    fn create(&self, parent: u64, name: &[u8]) -> wki_abi::WkiResult<u64>;
    fn unlink(&self, parent: u64, name: &[u8]) -> wki_abi::WkiResult<()>;
    fn readdir(&self, inode: u64, out: &mut [u8]) -> wki_abi::WkiResult<usize>;
}

/// Kinds of resource a registry hosts, used to route `can_remote`/
/// `on_remote_attach` checks to the right registry, and `lookup` to hand
/// device-server an execution handle once attach succeeds. `register`/
/// `unregister` are the embedding kernel's own concern (how a local block
/// driver or mounted filesystem gets into this registry in the first
/// place) and aren't part of this trait — WKI only ever calls the four
/// methods below.
pub trait BlockRegistry: Send + Sync {
    fn can_remote(&self, resource_id: u32) -> bool;
    fn on_remote_attach(&self, resource_id: u32) -> bool;
    fn on_remote_detach(&self, resource_id: u32);
    fn lookup(&self, resource_id: u32) -> Option<&'static dyn BlockDevice>;
}

pub trait NetRegistry: Send + Sync {
    fn can_remote(&self, resource_id: u32) -> bool;
    fn on_remote_attach(&self, resource_id: u32) -> bool;
    fn on_remote_detach(&self, resource_id: u32);
    fn lookup(&self, resource_id: u32) -> Option<&'static dyn NetDeviceOps>;
}

pub trait VfsRegistry: Send + Sync {
    fn can_remote(&self, resource_id: u32) -> bool;
    fn on_remote_attach(&self, resource_id: u32) -> bool;
    fn on_remote_detach(&self, resource_id: u32);
    fn lookup(&self, resource_id: u32) -> Option<&'static dyn VfsBackend>;
}

/// Scheduler hook used by remote-compute task placement.
pub trait TaskScheduler: Send + Sync {
    fn spawn_kthread(&self, entry: fn(), name: &str) -> bool;
    /// Place `binary` for execution locally, returning a remote-pid-style
    /// handle on success.
    fn place_process(&self, binary: &[u8], args: &[u8]) -> Option<u64>;
    /// `true` if the scheduler judges local placement infeasible right now
    /// and a remote-compute submission should be attempted instead.
    fn try_remote_placement(&self) -> bool;
}

/// Physical page allocator used by zone backing allocation and the
/// ivshmem-style transport's RDMA pool.
pub trait PhysAllocator: Send + Sync {
    fn alloc_pages(&self, count: usize) -> Option<u64>;
    fn free_pages(&self, phys_addr: u64, count: usize);
    /// Translate a physical address this allocator handed out into a
    /// directly-accessible pointer (e.g. via the embedding kernel's HHDM).
    /// WKI never walks page tables itself.
    fn phys_to_virt(&self, phys_addr: u64) -> *mut u8;
}

// A trait object is a fat pointer (data + vtable); a plain `AtomicPtr` only
// stores a thin pointer, so each collaborator slot is a `OnceLock<&'static
// dyn Trait>` instead — `OnceLock` already holds an arbitrary `T` behind an
// atomic state machine (see `once_lock.rs`), which covers fat pointers too.
macro_rules! collaborator_cell {
    ($trait:ident, $cell:ident, $register:ident, $get:ident) => {
        static $cell: crate::once_lock::OnceLock<&'static dyn $trait> =
            crate::once_lock::OnceLock::new();

        /// Register the collaborator implementation. Idempotent: only the
        /// first call takes effect, matching `OnceLock` semantics.
        pub fn $register(implementation: &'static dyn $trait) {
            $cell.call_once(|| implementation);
        }

        /// Fetch the registered collaborator, if one has been set.
        pub fn $get() -> Option<&'static dyn $trait> {
            $cell.get().copied()
        }
    };
}

collaborator_cell!(InterruptControl, INTERRUPT_CONTROL, register_interrupt_control, interrupt_control);
collaborator_cell!(PreemptControl, PREEMPT_CONTROL, register_preempt_control, preempt_control);
collaborator_cell!(MonotonicClock, MONOTONIC_CLOCK, register_monotonic_clock, monotonic_clock);
collaborator_cell!(LinkDriver, LINK_DRIVER, register_link_driver, link_driver);
collaborator_cell!(BlockRegistry, BLOCK_REGISTRY, register_block_registry, block_registry);
collaborator_cell!(NetRegistry, NET_REGISTRY, register_net_registry, net_registry);
collaborator_cell!(VfsRegistry, VFS_REGISTRY, register_vfs_registry, vfs_registry);
collaborator_cell!(TaskScheduler, TASK_SCHEDULER, register_task_scheduler, task_scheduler);
collaborator_cell!(PhysAllocator, PHYS_ALLOCATOR, register_phys_allocator, phys_allocator);
