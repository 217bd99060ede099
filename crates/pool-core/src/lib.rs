//! Supervised worker pool for a long-lived Tailwind CSS CLI subprocess.
//!
//! Entry point is [`Pool`]: filter incoming options for the active CLI
//! version (`filter`), fingerprint the result (`fingerprint`), and either
//! reuse or provision a [`worker`] for that fingerprint before running the
//! output [`capture`] protocol. `launcher` abstracts subprocess creation so
//! tests run entirely in-process.

mod capture;
mod error;
mod filter;
mod fingerprint;
pub mod launcher;
mod metrics;
mod pool;
mod worker;

pub use error::PoolError;
pub use fingerprint::fingerprint;
pub use filter::{filter_options, is_supported, supported};
pub use launcher::{Launcher, LaunchedProcess, ProcessHandle, ProcessLauncher, WorkerSpec};
pub use metrics::Metrics;
pub use pool::{validate_shapes, CompileRequest, CompileResponse, Pool};
pub use worker::{
    CorrelationToken, SubmitError, WorkerCounters, WorkerEvent, WorkerFailure, WorkerHandle,
    WorkerHealth, WorkerOutcome, WorkerSnapshot,
};

pub use tailwind_pool_proto as proto;
