//! Compile-time tuning constants.
//!
//! Every timer, threshold, and bound the fabric uses lives here rather than
//! scattered as magic numbers through the subsystem crates, so a deployment
//! can retune without hunting through `channel`/`peer`/`routing`/etc.

/// §4.C: default retransmission timeout, nanoseconds.
pub const RTO_DEFAULT_NS: u64 = 100_000_000;
/// §4.C: RTO floor.
pub const RTO_MIN_NS: u64 = 50_000_000;
/// §4.C: RTO ceiling.
pub const RTO_MAX_NS: u64 = 500_000_000;
/// §4.C: duplicate ACKs before fast retransmit fires.
pub const FAST_RETRANSMIT_DUP_ACKS: u32 = 3;
/// §4.C: retransmit attempts before the channel (and its peer) is fenced.
pub const MAX_RETRANSMITS: u32 = 8;

/// §4.C: initial send credits for the Control channel class.
pub const CREDITS_CONTROL: u16 = 64;
/// §4.C: initial send credits for the ZoneMgmt channel class.
pub const CREDITS_ZONE_MGMT: u16 = 32;
/// §4.C: initial send credits for the EventBus channel class.
pub const CREDITS_EVENT_BUS: u16 = 128;
/// §4.C: initial send credits for the Resource channel class.
pub const CREDITS_RESOURCE: u16 = 32;
/// §4.C: initial send credits for dynamically allocated channels.
pub const CREDITS_DYNAMIC: u16 = 256;

/// §4.D: HELLO broadcast cadence.
pub const HELLO_INTERVAL_MS: u64 = 1_000;
/// §4.D: default negotiated heartbeat interval absent a peer proposal.
pub const HEARTBEAT_INTERVAL_DEFAULT_MS: u64 = 300;
/// §4.D: heartbeat interval negotiation floor.
pub const HEARTBEAT_INTERVAL_MIN_MS: u64 = 100;
/// §4.D: heartbeat interval negotiation ceiling.
pub const HEARTBEAT_INTERVAL_MAX_MS: u64 = 1_000;
/// §4.D: heartbeat send jitter, as a percentage of the interval.
pub const HEARTBEAT_JITTER_PCT: u64 = 25;
/// §4.D: missed-heartbeat count before a peer is eligible for fencing.
pub const HEARTBEAT_MISS_THRESHOLD: u64 = 5;
/// §4.D: minimum time since connect before a peer can be fenced, even if
/// heartbeats are already missing (protects a just-joined peer from a
/// spurious fence on the first few beats).
pub const PEER_GRACE_PERIOD_NS: u64 = 5_000_000_000;

/// §4.E: LSDB entry max age, as a multiple of the LSA refresh interval.
pub const LSA_REFRESH_INTERVAL_MS: u64 = 5_000;
/// Configurable multiple of [`LSA_REFRESH_INTERVAL_MS`] an LSDB entry may go
/// unrefreshed before aging out (spec.md §9 open question: resolved here as
/// a named, overridable constant rather than a hardcoded "5 s").
pub const LSA_MAX_AGE_MULTIPLE: u64 = 3;

/// §4.I: reliable-event retry cadence.
pub const EVENT_RETRY_INTERVAL_MS: u64 = 50;
/// §4.I: reliable-event retry attempts before the entry is dropped.
pub const EVENT_MAX_RETRIES: u32 = 5;
/// §4.I: event replay log capacity.
pub const EVENT_LOG_CAPACITY: usize = 128;

/// §4.J: zone read/write RPC timeout.
pub const ZONE_OP_TIMEOUT_MS: u64 = 50;
/// §4.H/§4.K: device/attach and task RPC spin-wait timeout.
pub const ATTACH_TIMEOUT_MS: u64 = 2_000;

/// §4.K: LOAD_REPORT broadcast cadence.
pub const LOAD_REPORT_INTERVAL_MS: u64 = 1_000;
/// §4.K: a cached LOAD_REPORT older than this is ineligible for remote
/// placement ("valid recent (< 1 s old) report").
pub const LOAD_REPORT_STALE_MS: u64 = 1_000;
/// §4.K: load penalty added to a remote node's reported load before
/// comparing against the local load in `try_remote_placement`.
pub const REMOTE_PLACEMENT_PENALTY: u16 = 200;
/// §4.K/§9 re-architecture: fixed remote-task table capacity (one slot per
/// in-flight submitted-or-running remote task, either direction).
pub const MAX_REMOTE_TASKS: usize = 256;

/// §4.H: VFS proxy read-ahead/write-behind buffer size.
pub const VFS_CACHE_SIZE: usize = 4096;
/// §4.H: VFS proxy directory-listing cache staleness, microseconds.
pub const VFS_DIR_CACHE_STALE_US: u64 = 5_000_000;
/// §4.H: NIC proxy background statistics-poll cadence ("≈1 Hz").
pub const NET_STATS_POLL_INTERVAL_MS: u64 = 1_000;

/// §4.J/§3.1: max bytes carried per ZONE_READ_RESP/ZONE_WRITE_REQ chunk.
pub const ZONE_CHUNK_MAX: usize = 1024;
/// §4.J/§9 re-architecture: fixed zone-table capacity.
pub const MAX_ZONES: usize = 256;
/// §4.J: page size used to validate `ZONE_CREATE_REQ::size` alignment.
pub const ZONE_PAGE_SIZE: u32 = 4096;
/// §4.K/§3.1: max bytes carried per TASK_COMPLETE output chunk.
pub const TASK_OUTPUT_MAX: usize = 1024;

/// §9 re-architecture: fixed peer-table capacity.
pub const MAX_PEERS: usize = 256;
/// §9 re-architecture: fixed transport-registry capacity.
pub const MAX_TRANSPORTS: usize = 8;
/// §9 re-architecture: fixed per-peer channel-table capacity.
pub const MAX_CHANNELS_PER_PEER: usize = 256;

/// §3.2: bounded HELLO retries while a peer sits in `HelloSent` before the
/// slot is reclaimed.
pub const HELLO_MAX_RETRIES: u32 = 5;

/// §5: periodic dispatcher tick cadence that drives heartbeats, retransmit
/// deadlines, LSA refresh/aging, event retries, and resource GC.
pub const TIMER_TICK_INTERVAL_MS: u64 = 10;

/// §4.F: fixed resource-ad table capacity (ads from every known peer plus
/// our own locally-owned resources share this arena).
pub const MAX_RESOURCE_ADS: usize = 512;
/// §4.F/§3.1: max resource name length carried in `RESOURCE_ADVERT`
/// (`name_len` is a single byte, but the wire buffer this is copied into is
/// bounded well below 255 in practice).
pub const MAX_RESOURCE_NAME_LEN: usize = 64;

/// §4.G: fixed device-server binding table capacity (every consumer's
/// attached-resource bindings share this arena).
pub const MAX_DEV_BINDINGS: usize = 512;

/// §4.H: fixed device-proxy attach-table capacity, mirroring
/// [`MAX_DEV_BINDINGS`] on the client side.
pub const MAX_PROXY_ATTACHES: usize = 512;
/// §4.H: fixed table capacity for open remote-VFS handles (mount-local
/// file descriptors backed by a proxy).
pub const MAX_VFS_OPEN_HANDLES: usize = 256;

/// §3.1/§9 re-architecture: fixed capacity for the dispatcher's
/// `(peer, channel_id)`-keyed `Channel` engine table. Sized for the four
/// well-known channels on every connected peer plus headroom for dynamic
/// per-binding channels drawn from [`MAX_DEV_BINDINGS`]/[`MAX_PROXY_ATTACHES`].
pub const MAX_CHANNELS_TOTAL: usize = 2048;
