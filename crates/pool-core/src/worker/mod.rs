//! C3: Worker.
//!
//! Mental model: each worker is an actor — a single `tokio::spawn`ed task
//! owning one subprocess, reachable only through [`WorkerHandle`]'s message
//! passing. That gives the state machine below its ordering guarantee for
//! free: because exactly one task ever mutates a worker's state, "submit
//! while a submission is already pending" and "classify this line while
//! handling the previous one" are impossible by construction, not by lock
//! discipline.
//!
//! ```text
//!           spawn          readiness marker         submit()
//!   (none) ------> Starting ---------------> Ready ----------> Working
//!                     |                        ^                  |
//!                     | readiness timeout       |  output burst    | diagnostic
//!                     v                         |                  v
//!                 Terminated <--- exit ---- (any state)       Degraded
//!                                                 ^                |
//!                                                 `--- burst -------
//! ```
//!
//! The fourth real transition, `Draining`, is entered only by an explicit
//! [`WorkerHandle::stop`] call (idle eviction, saturation eviction) and
//! always resolves to `Terminated`.
//!
//! Invariant enforced here: at most one submission is ever in flight per
//! worker ([`SubmitError::Busy`]); the per-fingerprint serialization the
//! scheduler does on top is a second line of defense, not the only one.

mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tailwind_pool_proto::{Fingerprint, WorkerId, WorkerState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::launcher::{LaunchedProcess, ProcessHandle};
use registry::ListenerRegistry;

pub type CorrelationToken = u64;

/// What a listener receives: either the output burst it was waiting for, or
/// the reason the worker could not produce one for this submission.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Burst(Arc<[u8]>),
    Failed(WorkerFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFailure {
    /// Exited (or timed out) before ever reaching `Ready`.
    StartupFailed,
    /// Exited mid-submission without emitting a burst.
    ExitBeforeOutput,
    /// The worker is gone; nothing will ever answer.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Still `Starting`; not ready to accept input yet.
    NotReady,
    /// A prior submission is still in flight (Invariant 4).
    Busy,
    Terminated,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerCounters {
    pub submissions: u64,
    pub outputs_total: u64,
    pub outputs_nonempty: u64,
    pub diagnostics: u64,
}

/// A cheap, lock-free-to-read-from-outside point-in-time view of a worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub counters: WorkerCounters,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub preserved_output: Option<Arc<[u8]>>,
}

/// A health report for a worker, the library-level surface a caller outside
/// the scheduler (an admin endpoint, a `stats`-style subcommand) would poll
/// instead of reconstructing these fields from [`WorkerSnapshot`] itself.
#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub uptime: Duration,
    pub outputs_total: u64,
    pub compilations: u64,
    pub errors: u64,
    pub state: WorkerState,
    pub has_preserved: bool,
}

struct WorkerShared {
    state: WorkerState,
    counters: WorkerCounters,
    last_activity_at: Instant,
    /// Tier 3 capture source: the most recent non-empty burst, kept around
    /// even after the worker that produced it has exited.
    preserved_output: Option<Arc<[u8]>>,
    consecutive_diagnostics: u32,
}

/// A submission accepted by the worker, paired with the generation (its
/// `counters.outputs_total` at the moment the listener was registered) the
/// capture protocol needs to tell "my own fresh burst" apart from "a burst
/// left over from a submission that raced me."
type SubmitAck = Result<(oneshot::Receiver<WorkerOutcome>, u64), SubmitError>;

enum WorkerCommand {
    Submit {
        token: CorrelationToken,
        request_id: u64,
        content: Vec<u8>,
        ack: oneshot::Sender<SubmitAck>,
    },
    Stop {
        reason: String,
        done: oneshot::Sender<()>,
    },
}

/// A reference to a running worker actor. Cloneable; every clone talks to
/// the same underlying task.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub fingerprint: Fingerprint,
    pub created_at: Instant,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    shared: Arc<Mutex<WorkerShared>>,
    next_token: Arc<AtomicU64>,
}

impl WorkerHandle {
    /// Registers a listener and writes `content` to the subprocess, or
    /// rejects immediately if the worker cannot accept it right now.
    ///
    /// `request_id` is carried through to the worker's listener registry
    /// (purely for diagnostics); the returned `u64` is this submission's
    /// generation — the worker's `outputs_total` counter at the moment its
    /// listener was registered — which the capture protocol compares
    /// against later to tell a fresh burst from a stale one.
    pub async fn submit(
        &self,
        request_id: u64,
        content: Vec<u8>,
    ) -> Result<(oneshot::Receiver<WorkerOutcome>, u64), SubmitError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let token = self.next_token();
        if self
            .cmd_tx
            .send(WorkerCommand::Submit { token, request_id, content, ack: ack_tx })
            .await
            .is_err()
        {
            return Err(SubmitError::Terminated);
        }
        ack_rx.await.unwrap_or(Err(SubmitError::Terminated))
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let shared = self.shared.lock().expect("worker mutex poisoned");
        WorkerSnapshot {
            state: shared.state,
            counters: shared.counters,
            created_at: self.created_at,
            last_activity_at: shared.last_activity_at,
            preserved_output: shared.preserved_output.clone(),
        }
    }

    /// Whether the worker can currently accept a submission.
    pub fn is_ready(&self) -> bool {
        matches!(self.snapshot().state, WorkerState::Ready | WorkerState::Degraded)
    }

    /// Polls until the worker reaches `Ready`/`Degraded`, fails outright
    /// (`Terminated`), or `deadline` passes.
    pub async fn wait_until_ready(&self, deadline: Instant) -> Result<(), crate::error::PoolError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        loop {
            match self.snapshot().state {
                WorkerState::Ready | WorkerState::Degraded => return Ok(()),
                WorkerState::Terminated => {
                    return Err(crate::error::PoolError::StartupFailed(
                        "worker exited before ready".into(),
                    ));
                }
                _ => {
                    if Instant::now() >= deadline {
                        return Err(crate::error::PoolError::Timeout(budget));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// A point-in-time health report, the shape a caller outside the
    /// scheduler (an admin surface, a `stats`-style subcommand) would want
    /// instead of reaching into [`WorkerSnapshot`]'s raw counters.
    pub fn health(&self) -> WorkerHealth {
        let snapshot = self.snapshot();
        WorkerHealth {
            created_at: snapshot.created_at,
            last_activity_at: snapshot.last_activity_at,
            uptime: snapshot.created_at.elapsed(),
            outputs_total: snapshot.counters.outputs_total,
            compilations: snapshot.counters.submissions,
            errors: snapshot.counters.diagnostics,
            state: snapshot.state,
            has_preserved: snapshot.preserved_output.is_some(),
        }
    }

    /// Requests a graceful stop; resolves once the subprocess has exited (or
    /// the actor is already gone).
    pub async fn stop(&self, reason: impl Into<String>) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(WorkerCommand::Stop {
                reason: reason.into(),
                done: done_tx,
            })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    /// A token unique within this worker, correlating a submission's
    /// listener registration with log lines about it.
    fn next_token(&self) -> CorrelationToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

struct WorkerActor {
    id: WorkerId,
    shared: Arc<Mutex<WorkerShared>>,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    stdin: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    chunk_rx: mpsc::Receiver<Chunk>,
    process: Box<dyn ProcessHandle>,
    registry: ListenerRegistry,
    readiness_timeout: Duration,
    degraded_error_threshold: u32,
    on_event: Box<dyn Fn(WorkerEvent) + Send>,
}

enum Chunk {
    Stdout(String),
    Stderr(String),
}

/// Notable state transitions and lifecycle events the actor reports
/// upward, so the scheduler can update metrics without polling.
pub enum WorkerEvent {
    StateChanged { from: WorkerState, to: WorkerState },
    Exited { had_pending: bool },
}

/// Spawns the reader tasks and the actor task for one worker, returning a
/// handle the scheduler can hold in its fingerprint map.
pub fn spawn_worker(
    id: WorkerId,
    fingerprint: Fingerprint,
    process: LaunchedProcess,
    readiness_timeout: Duration,
    degraded_error_threshold: u32,
    on_event: impl Fn(WorkerEvent) + Send + 'static,
) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (chunk_tx, chunk_rx) = mpsc::channel(64);

    spawn_line_reader(process.stdout, chunk_tx.clone(), Chunk::Stdout);
    spawn_line_reader(process.stderr, chunk_tx, Chunk::Stderr);

    let now = Instant::now();
    let shared = Arc::new(Mutex::new(WorkerShared {
        state: WorkerState::Starting,
        counters: WorkerCounters::default(),
        last_activity_at: now,
        preserved_output: None,
        consecutive_diagnostics: 0,
    }));

    let actor = WorkerActor {
        id,
        shared: shared.clone(),
        cmd_rx,
        stdin: process.stdin,
        chunk_rx,
        process: process.handle,
        registry: ListenerRegistry::new(),
        readiness_timeout,
        degraded_error_threshold,
        on_event: Box::new(on_event),
    };
    tokio::spawn(actor.run());

    WorkerHandle {
        id,
        fingerprint,
        created_at: now,
        cmd_tx,
        shared,
        next_token: Arc::new(AtomicU64::new(0)),
    }
}

fn spawn_line_reader(
    reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    tx: mpsc::Sender<Chunk>,
    wrap: fn(String) -> Chunk,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(wrap(line)).await.is_err() {
                        return;
                    }
                }
                _ => return,
            }
        }
    });
}

/// The classic "is this line a readiness marker or an output burst"
/// heuristic: any chunk mentioning a compile-time summary or carrying a
/// brace is treated as both eligible for readiness *and* as output, since
/// in practice the CLI's first compiled burst often doubles as the signal
/// that it has finished starting up. Kept intentionally permissive rather
/// than tightened to require a brace-free "ready" line, because no such
/// line is guaranteed to exist across CLI versions or flag combinations.
fn classify(line: &str) -> (bool, bool) {
    let is_burst = line.contains('{') || line.contains('}');
    let is_readiness = is_burst || line.contains("Done in");
    (is_readiness, is_burst)
}

impl WorkerActor {
    async fn run(mut self) {
        let mut readiness_deadline = Box::pin(tokio::time::sleep(self.readiness_timeout));
        // Both readers close once the subprocess closes its pipes, which
        // can happen a tick before `wait()` resolves. Stop polling the
        // channel once drained so a closed receiver (always immediately
        // `Ready(None)`) can't spin the select loop while waiting for exit.
        let mut chunks_closed = false;

        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }

                chunk = self.chunk_rx.recv(), if !chunks_closed => {
                    match chunk {
                        Some(chunk) => self.handle_chunk(chunk),
                        None => chunks_closed = true,
                    }
                }

                status = self.process.wait() => {
                    self.handle_exit(status).await;
                    return;
                }

                () = &mut readiness_deadline, if self.is_starting() => {
                    self.handle_readiness_timeout();
                    return;
                }
            }
        }
        // cmd_rx closed: every WorkerHandle was dropped. Tear the
        // subprocess down rather than leaking it.
        let _ = self.process.start_kill().await;
        let _ = self.process.wait().await;
    }

    fn is_starting(&self) -> bool {
        self.shared.lock().expect("worker mutex poisoned").state == WorkerState::Starting
    }

    fn transition(&self, to: WorkerState) {
        let from = {
            let mut shared = self.shared.lock().expect("worker mutex poisoned");
            let from = shared.state;
            shared.state = to;
            shared.last_activity_at = Instant::now();
            from
        };
        if from != to {
            (self.on_event)(WorkerEvent::StateChanged { from, to });
        }
    }

    async fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Submit { token, request_id, content, ack } => {
                let current = self.shared.lock().expect("worker mutex poisoned").state;
                let result = match current {
                    WorkerState::Starting => Err(SubmitError::NotReady),
                    WorkerState::Working => Err(SubmitError::Busy),
                    WorkerState::Terminated => Err(SubmitError::Terminated),
                    WorkerState::Ready | WorkerState::Degraded => {
                        let (burst_tx, burst_rx) = oneshot::channel();
                        // Captured before this submission's own burst can
                        // possibly arrive (the actor processes one command
                        // at a time): the capture protocol uses it to reject
                        // a `preserved_output` left over from an earlier
                        // submission as stale.
                        let generation = {
                            let mut shared = self.shared.lock().expect("worker mutex poisoned");
                            shared.counters.submissions += 1;
                            shared.counters.outputs_total
                        };
                        self.registry.register(token, request_id, burst_tx);
                        self.transition(WorkerState::Working);
                        self.write_stdin(content).await;
                        Ok((burst_rx, generation))
                    }
                };
                let _ = ack.send(result);
            }
            WorkerCommand::Stop { reason, done } => {
                tracing::debug!(worker_id = self.id.0, %reason, "stopping worker");
                self.transition(WorkerState::Draining);
                let _ = self.process.start_kill().await;
                let status = self.process.wait().await;
                self.fail_pending(WorkerFailure::Terminated);
                self.transition(WorkerState::Terminated);
                (self.on_event)(WorkerEvent::Exited { had_pending: false });
                tracing::debug!(worker_id = self.id.0, ?status, "worker stopped");
                let _ = done.send(());
            }
        }
    }

    /// Writes `content` to the subprocess's stdin.
    ///
    /// This blocks the actor's own event loop for the duration of the
    /// write — unlike the stdout/stderr readers, which run as independent
    /// tasks so a slow writer can't stall reading. A request's content is
    /// one file's worth of bytes and the OS pipe buffer comfortably absorbs
    /// it in one write; a genuinely stalled subprocess still surfaces
    /// through the caller's own compile timeout racing this future.
    async fn write_stdin(&mut self, content: Vec<u8>) {
        if let Err(e) = self.stdin.write_all(&content).await {
            tracing::warn!(error = %e, "failed writing content to worker stdin");
            return;
        }
        let _ = self.stdin.flush().await;
    }

    fn handle_chunk(&mut self, chunk: Chunk) {
        let line = match &chunk {
            Chunk::Stdout(s) | Chunk::Stderr(s) => s.as_str(),
        };
        let (is_readiness, is_burst) = classify(line);
        let was_starting = self.is_starting();

        {
            let mut shared = self.shared.lock().expect("worker mutex poisoned");
            shared.last_activity_at = Instant::now();
        }

        if was_starting && is_readiness {
            self.transition(WorkerState::Ready);
        }

        if is_burst {
            self.handle_burst(line.as_bytes());
        } else if !was_starting {
            self.handle_diagnostic();
        }
    }

    fn handle_burst(&mut self, bytes: &[u8]) {
        let data: Arc<[u8]> = Arc::from(bytes.to_vec().into_boxed_slice());
        {
            let mut shared = self.shared.lock().expect("worker mutex poisoned");
            shared.preserved_output = Some(data.clone());
            shared.counters.outputs_total += 1;
            shared.counters.outputs_nonempty += 1;
            shared.consecutive_diagnostics = 0;
        }
        self.registry.drain_with(|| WorkerOutcome::Burst(data.clone()));
        let state = self.shared.lock().expect("worker mutex poisoned").state;
        if state == WorkerState::Working || state == WorkerState::Degraded {
            self.transition(WorkerState::Ready);
        }
    }

    fn handle_diagnostic(&mut self) {
        let should_degrade = {
            let mut shared = self.shared.lock().expect("worker mutex poisoned");
            shared.counters.diagnostics += 1;
            shared.consecutive_diagnostics += 1;
            shared.consecutive_diagnostics >= self.degraded_error_threshold
        };
        if should_degrade {
            let state = self.shared.lock().expect("worker mutex poisoned").state;
            if state != WorkerState::Degraded {
                self.transition(WorkerState::Degraded);
            }
        }
    }

    fn fail_pending(&mut self, failure: WorkerFailure) {
        if self.registry.is_empty() {
            return;
        }
        self.registry.drain_with(|| WorkerOutcome::Failed(failure));
    }

    fn handle_readiness_timeout(&mut self) {
        tracing::warn!(worker_id = self.id.0, "worker missed readiness deadline");
        self.fail_pending(WorkerFailure::StartupFailed);
        self.transition(WorkerState::Terminated);
        (self.on_event)(WorkerEvent::Exited { had_pending: true });
    }

    async fn handle_exit(&mut self, status: std::io::Result<i32>) {
        let had_pending = !self.registry.is_empty();
        let pending_count = self.registry.len();
        let failure = match self.shared.lock().expect("worker mutex poisoned").state {
            WorkerState::Starting => WorkerFailure::StartupFailed,
            _ => WorkerFailure::ExitBeforeOutput,
        };
        if had_pending {
            self.fail_pending(failure);
        }
        self.transition(WorkerState::Terminated);
        tracing::debug!(
            worker_id = self.id.0,
            ?status,
            pending_count,
            "worker subprocess exited"
        );
        (self.on_event)(WorkerEvent::Exited { had_pending });
    }
}
