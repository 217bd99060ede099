//! Wire-level and configuration types shared between the pool core and any
//! host that embeds it (the demonstration CLI, or a future IPC boundary).
//!
//! Nothing in this module spawns a process or holds a lock; it is the data
//! model only. Behavior (filtering, fingerprinting, capture) lives in
//! `tailwind-pool-core`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The two major versions of the external CLI this pool has a contract with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CliVersion {
	/// Tailwind CSS v3.x: config-file driven, content globs, PostCSS plugin chain.
	V3,
	/// Tailwind CSS v4.x: CSS-native configuration, no content globs or config path.
	V4,
}

/// The logical CLI options a request may carry. Unknown-to-this-enum flags
/// simply cannot be represented and are never forwarded to the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptionName {
	/// `--input` / input stylesheet path.
	InputPath,
	/// `--output` / output stylesheet path.
	OutputPath,
	/// `--content` glob list (v3 only).
	ContentGlobs,
	/// `--config` path (v3 only).
	ConfigPath,
	/// `--postcss` flag (v3 only).
	Postcss,
	/// `--poll` flag (v3 only).
	Poll,
	/// `--no-autoprefixer` flag (v3 only).
	NoAutoprefixer,
	/// `--minify` flag (common).
	Minify,
	/// `--watch` flag (common).
	Watch,
	/// `--optimize` flag (v4 only).
	Optimize,
	/// `--cwd` working directory (v4 only).
	WorkingDir,
	/// source map emission (v4 only).
	SourceMap,
}

/// The value carried by a single option.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptionValue {
	/// A string-valued option, e.g. a path.
	Str(String),
	/// A boolean flag.
	Bool(bool),
	/// A list-valued option, e.g. content globs.
	List(Vec<String>),
}

/// An unordered, `nil`-free mapping of option name to value.
///
/// Backed by a `BTreeMap` so that iteration order is always the canonical
/// sorted-by-key order the fingerprint and the argument filter both rely on.
pub type RequestOptions = BTreeMap<OptionName, OptionValue>;

/// Scheduler-level tie-break priority. Never overrides a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
	Low,
	Normal,
	High,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Normal
	}
}

impl Priority {
	/// Maps to an ordinal used for max-heap ordering (higher runs first).
	pub(crate) fn rank(self) -> u8 {
		match self {
			Priority::Low => 0,
			Priority::Normal => 1,
			Priority::High => 2,
		}
	}
}

impl PartialOrd for Priority {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Priority {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.rank().cmp(&other.rank())
	}
}

/// Opaque, stable key identifying a reusable worker.
///
/// Two requests with equal fingerprints MUST be serviceable by the same
/// worker (Invariant 1). Computed by `tailwind_pool_core::fingerprint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl std::fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// Which tier of the output capture protocol produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureMethod {
	/// Tier 1: the in-memory listener callback fired before the deadline.
	Immediate,
	/// Tier 2: the `output` path was read from disk.
	FileBased,
	/// Tier 3: `Worker::snapshot().preserved_output` was non-empty.
	PreservedState,
	/// Tier 4: a fresh worker was provisioned and retried once.
	ForcedRegeneration,
}

/// The worker state machine's states (see SPEC_FULL §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
	Starting,
	Ready,
	Working,
	Draining,
	Degraded,
	Terminated,
}

/// Unique identifier for a worker, scoped to one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

/// Machine-readable reason a request failed, mirrored 1:1 onto
/// `tailwind_pool_core::PoolError` so it can cross a future IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
	InvalidArgs,
	NoCapacity,
	StartupFailed,
	ExitBeforeOutput,
	Timeout,
	EmptyOutput,
	UnsupportedVersion,
	Internal,
	Io,
}

/// Typed events emitted at scheduler and worker boundaries (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
	/// A compile request started.
	CompileStart {
		fingerprint: Fingerprint,
		priority: Priority,
	},
	/// A compile request finished successfully.
	CompileStop {
		fingerprint: Fingerprint,
		capture_method: CaptureMethod,
		total: Duration,
	},
	/// A compile request failed.
	CompileError {
		fingerprint: Fingerprint,
		reason: ErrorKind,
	},
	/// A worker transitioned between states.
	WorkerStateChange {
		worker_id: WorkerId,
		from: WorkerState,
		to: WorkerState,
	},
	/// A new worker process was spawned for a fingerprint.
	WorkerCreated {
		worker_id: WorkerId,
		fingerprint: Fingerprint,
	},
	/// An existing worker was reused for a new submission.
	WorkerReused {
		worker_id: WorkerId,
		fingerprint: Fingerprint,
	},
	/// A worker was evicted (idle timeout, crash, or explicit stop).
	WorkerEvicted { worker_id: WorkerId, reason: String },
	/// A metrics snapshot was taken (e.g. for a periodic exporter).
	MetricsSnapshot,
}

/// Point-in-time counters, suitable for exposing over `stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
	pub compilations_total: u64,
	pub compilations_ok: u64,
	pub compilations_err: u64,
	pub worker_created: u64,
	pub worker_reused: u64,
	pub worker_evicted: u64,
	pub batch_groups: u64,
	pub capture_immediate: u64,
	pub capture_file_based: u64,
	pub capture_preserved_state: u64,
	pub capture_forced_regeneration: u64,
}

/// A cheap summary of a reservoir-sampled timing histogram.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramSnapshot {
	pub count: u64,
	pub min: Duration,
	pub max: Duration,
	pub p50: Duration,
	pub p99: Duration,
}

/// Full metrics snapshot returned by `Pool::stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
	pub counters: Counters,
	pub queue_wait: HistogramSnapshot,
	pub readiness_wait: HistogramSnapshot,
	pub submit_to_output: HistogramSnapshot,
	pub total: HistogramSnapshot,
	pub pool_size: usize,
}

/// Every tunable knob from SPEC_FULL §6, `Default`-constructible so tests
/// never have to touch process-wide state to get a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
	/// Upper bound on concurrently live (non-Terminated) workers.
	pub max_pool_size: usize,
	/// Default deadline budget for a single `compile` call.
	pub compile_timeout: Duration,
	/// How long a worker may sit in `Starting` before it is failed.
	pub readiness_timeout: Duration,
	/// How long a `Ready` worker may sit unused before eviction.
	pub idle_eviction_after: Duration,
	/// Consecutive diagnostic chunks before a worker is marked `Degraded`.
	pub degraded_error_threshold: u32,
	/// Which CLI major version is active; drives the argument filter.
	pub active_cli_version: CliVersion,
	/// Tier 1 (immediate) capture timeout; defaults to `compile_timeout`.
	pub capture_tier1_timeout: Duration,
	/// Tier 4 (forced regeneration) capture timeout; defaults to half of tier 1.
	pub capture_tier4_timeout: Duration,
	/// Grace period a worker stays queryable (for tier 3 capture) after its
	/// subprocess has exited, before finalizing to `Terminated`.
	pub post_exit_grace: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		let compile_timeout = Duration::from_secs(15);
		Self {
			max_pool_size: 4,
			compile_timeout,
			readiness_timeout: compile_timeout,
			idle_eviction_after: Duration::from_secs(10 * 60),
			degraded_error_threshold: 3,
			active_cli_version: CliVersion::V4,
			capture_tier1_timeout: compile_timeout,
			capture_tier4_timeout: compile_timeout / 2,
			post_exit_grace: Duration::from_millis(250),
		}
	}
}
