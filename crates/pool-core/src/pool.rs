//! C5: Pool Scheduler.
//!
//! Owns the map from fingerprint to live worker, the capacity bound, idle
//! eviction, and the priority wait queue used when the pool is saturated.
//! Reuse decisions and LRU eviction follow the same shape as a language
//! server's "one server process per project" broker: find-or-create by key,
//! evict the least-recently-used idle entry when full, never exceed the
//! configured ceiling.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tailwind_pool_proto::{
    CliVersion, Event, Fingerprint, PoolConfig, Priority, RequestOptions, WorkerId, WorkerState,
};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::capture::{self, CaptureConfig};
use crate::error::PoolError;
use crate::filter::{filter_options, shape_is_valid};
use crate::fingerprint::fingerprint;
use crate::launcher::{Launcher, WorkerSpec};
use crate::metrics::Metrics;
use crate::worker::{self, WorkerEvent, WorkerHandle};

/// Rejects any option whose value has a shape its `OptionName` could never
/// legally carry. Kept separate from `filter::filter_options`, which is
/// total and never errors; this is the one place in the pipeline that
/// actually fails a request for a bad shape.
pub fn validate_shapes(options: &RequestOptions) -> Result<(), PoolError> {
    for (&name, value) in options.iter() {
        if !shape_is_valid(name, value) {
            return Err(PoolError::InvalidArgs(format!(
                "option {name:?} has a value shape it cannot carry: {value:?}"
            )));
        }
    }
    Ok(())
}

/// One request to compile, already carrying everything the scheduler needs
/// to pick (or provision) a worker.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub version: CliVersion,
    pub options: RequestOptions,
    pub content: Vec<u8>,
    pub output_path: Option<PathBuf>,
    pub priority: Priority,
    /// Caller-supplied identity for this request, threaded down into the
    /// worker's listener registry for correlation in logs.
    pub correlation_id: u64,
    /// Caller-supplied deadline for the whole request, from acquiring a
    /// worker through the final capture tier — distinct from (and not
    /// derived from) `PoolConfig::compile_timeout`.
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct CompileResponse {
    pub bytes: Arc<[u8]>,
    pub method: tailwind_pool_proto::CaptureMethod,
    pub fingerprint: Fingerprint,
}

struct Slot {
    handle: WorkerHandle,
    /// Serializes submissions sharing this fingerprint (Invariant 4 held
    /// across the whole submit-then-capture round trip, not just the
    /// worker's own in-flight check).
    submit_lock: Arc<AsyncMutex<()>>,
    last_used: Instant,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; among equal priorities, earlier arrival
        // (smaller seq) first, hence the reversal on seq.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    workers: HashMap<Fingerprint, Slot>,
    /// Terminated workers kept alive briefly after being replaced in the
    /// map, purely so a tier-3 capture still in flight for the old
    /// instance can read `preserved_output`.
    retiring: Vec<(Instant, WorkerHandle)>,
    wait_queue: BinaryHeap<Waiter>,
}

pub struct Pool {
    config: PoolConfig,
    launcher: Arc<dyn Launcher>,
    metrics: Arc<Metrics>,
    state: AsyncMutex<PoolState>,
    next_worker_id: AtomicU64,
    next_waiter_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl Pool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            launcher,
            metrics: Arc::new(Metrics::new()),
            state: AsyncMutex::new(PoolState {
                workers: HashMap::new(),
                retiring: Vec::new(),
                wait_queue: BinaryHeap::new(),
            }),
            next_worker_id: AtomicU64::new(1),
            next_waiter_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        pool.clone().spawn_idle_sweep();
        pool
    }

    /// Stops the background idle-sweep task. Without this, the task's own
    /// `Arc<Pool>` clone keeps the pool alive forever even after every
    /// caller-held handle is dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.metrics.subscribe()
    }

    /// Compiles one request end to end: filter, fingerprint, acquire (or
    /// provision) a worker, submit, and run the capture protocol.
    pub async fn compile(&self, req: CompileRequest) -> Result<CompileResponse, PoolError> {
        let start = Instant::now();
        let filtered = filter_options(req.version, &req.options);
        validate_shapes(&filtered)?;
        let fp = fingerprint(req.version, &filtered);
        self.metrics.emit(Event::CompileStart {
            fingerprint: fp,
            priority: req.priority,
        });

        let result = self.compile_inner(&req, &filtered, fp).await;

        self.metrics.inc_compilation(result.is_ok());
        match &result {
            Ok(resp) => self.metrics.emit(Event::CompileStop {
                fingerprint: fp,
                capture_method: resp.method,
                total: start.elapsed(),
            }),
            Err(e) => self.metrics.emit(Event::CompileError {
                fingerprint: fp,
                reason: e.kind(),
            }),
        }
        self.metrics.total.record(start.elapsed());
        result
    }

    async fn compile_inner(
        &self,
        req: &CompileRequest,
        filtered: &RequestOptions,
        fp: Fingerprint,
    ) -> Result<CompileResponse, PoolError> {
        let deadline = req.deadline;
        let (handle, submit_lock) = self
            .acquire_worker(req.version, filtered, fp, req.priority, deadline)
            .await?;

        let _submit_guard = submit_lock.lock().await;
        let submit_started = Instant::now();
        let (rx, generation) = self
            .submit_with_retry(&handle, req.correlation_id, req.content.clone(), deadline)
            .await?;
        self.metrics.readiness_wait.record(submit_started.elapsed());

        // The request's own deadline bounds the capture phase too, not just
        // acquiring and submitting: a caller with a tight per-request
        // deadline must see it honored end to end, not just up through
        // submission, even when the pool's own capture-tier timeouts are
        // more generous.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let cfg = CaptureConfig {
            tier1_timeout: self.config.capture_tier1_timeout.min(remaining),
            tier4_timeout: self.config.capture_tier4_timeout.min(remaining),
            output_path: req.output_path.as_deref(),
        };
        let submit_to_output_start = Instant::now();
        let outcome = capture::capture(
            &handle,
            rx,
            generation,
            req.correlation_id,
            req.content.clone(),
            &cfg,
            || self.respawn(req.version, filtered, fp),
        )
        .await?;
        self.metrics.submit_to_output.record(submit_to_output_start.elapsed());
        self.metrics.inc_capture(outcome.method);

        self.touch(fp).await;
        Ok(CompileResponse {
            bytes: outcome.bytes,
            method: outcome.method,
            fingerprint: fp,
        })
    }

    /// Submits to a worker, tolerating the narrow race where the worker is
    /// still `Starting` even though it was found in the map (it was just
    /// provisioned by a concurrent caller for the same fingerprint).
    async fn submit_with_retry(
        &self,
        handle: &WorkerHandle,
        request_id: u64,
        content: Vec<u8>,
        deadline: Instant,
    ) -> Result<(oneshot::Receiver<worker::WorkerOutcome>, u64), PoolError> {
        loop {
            match handle.submit(request_id, content.clone()).await {
                Ok(submitted) => return Ok(submitted),
                Err(worker::SubmitError::NotReady) => {
                    if Instant::now() >= deadline {
                        return Err(PoolError::StartupFailed(
                            "worker never left Starting before the deadline".into(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(worker::SubmitError::Busy) => {
                    // Shouldn't happen while holding the fingerprint's
                    // submit lock, but don't spin indefinitely if it does.
                    if Instant::now() >= deadline {
                        return Err(PoolError::Timeout(self.config.compile_timeout));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(worker::SubmitError::Terminated) => {
                    return Err(PoolError::ExitBeforeOutput);
                }
            }
        }
    }

    /// Finds (or provisions) the worker for `fp`, waiting on the priority
    /// queue if the pool is saturated. Returns the worker and its
    /// per-fingerprint submit lock.
    async fn acquire_worker(
        &self,
        version: CliVersion,
        filtered: &RequestOptions,
        fp: Fingerprint,
        priority: Priority,
        deadline: Instant,
    ) -> Result<(WorkerHandle, Arc<AsyncMutex<()>>), PoolError> {
        loop {
            enum Decision {
                Reuse(WorkerHandle, Arc<AsyncMutex<()>>),
                Create,
                EvictThenCreate(WorkerId),
                Saturated,
            }

            let decision = {
                let mut state = self.state.lock().await;
                if let Some(slot) = state.workers.get(&fp) {
                    if slot.handle.snapshot().state != WorkerState::Terminated {
                        Decision::Reuse(slot.handle.clone(), slot.submit_lock.clone())
                    } else {
                        let dead = state.workers.remove(&fp).expect("just observed");
                        state.retiring.push((Instant::now(), dead.handle));
                        Decision::Create
                    }
                } else if state.workers.len() < self.config.max_pool_size {
                    Decision::Create
                } else if let Some(victim) = find_lru_idle(&state.workers) {
                    Decision::EvictThenCreate(victim)
                } else {
                    Decision::Saturated
                }
            };

            match decision {
                Decision::Reuse(handle, lock) => {
                    self.metrics.inc_worker_reused();
                    self.metrics.emit(Event::WorkerReused {
                        worker_id: handle.id,
                        fingerprint: fp,
                    });
                    return Ok((handle, lock));
                }
                Decision::Create => {
                    return self.provision(version, filtered, fp).await;
                }
                Decision::EvictThenCreate(victim_id) => {
                    self.evict_worker_id(victim_id, "saturation eviction").await;
                    return self.provision(version, filtered, fp).await;
                }
                Decision::Saturated => {
                    if Instant::now() >= deadline {
                        return Err(PoolError::NoCapacity);
                    }
                    self.wait_for_capacity(priority, deadline).await?;
                }
            }
        }
    }

    async fn provision(
        &self,
        version: CliVersion,
        filtered: &RequestOptions,
        fp: Fingerprint,
    ) -> Result<(WorkerHandle, Arc<AsyncMutex<()>>), PoolError> {
        let spec = build_spec(version, filtered);
        let process = self.launcher.launch(&spec).await?;

        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let metrics = self.metrics.clone();
        let handle = worker::spawn_worker(
            id,
            fp,
            process,
            self.config.readiness_timeout,
            self.config.degraded_error_threshold,
            move |event| {
                if let WorkerEvent::StateChanged { from, to } = event {
                    metrics.emit(Event::WorkerStateChange {
                        worker_id: id,
                        from,
                        to,
                    });
                }
            },
        );

        let submit_lock = Arc::new(AsyncMutex::new(()));
        {
            let mut state = self.state.lock().await;
            state.workers.insert(
                fp,
                Slot {
                    handle: handle.clone(),
                    submit_lock: submit_lock.clone(),
                    last_used: Instant::now(),
                },
            );
        }
        self.metrics.inc_worker_created();
        self.metrics.emit(Event::WorkerCreated {
            worker_id: id,
            fingerprint: fp,
        });
        Ok((handle, submit_lock))
    }

    /// Tier 4 hook: provisions an entirely new worker for `fp`, displacing
    /// whatever is currently in the slot (which, by construction, just
    /// failed to produce output).
    async fn respawn(
        &self,
        version: CliVersion,
        filtered: &RequestOptions,
        fp: Fingerprint,
    ) -> Result<WorkerHandle, PoolError> {
        let old = {
            let mut state = self.state.lock().await;
            state.workers.remove(&fp).map(|slot| slot.handle)
        };
        if let Some(old) = old {
            // Torn down promptly, the same as every other removal path
            // (`evict_worker_id`, `sweep_idle`) — it already failed to
            // produce output, so there's no reason to let its subprocess
            // keep running. Only after it's stopped does it go into
            // `retiring`, for any other in-flight tier-3 capture still
            // holding its own clone of this handle.
            old.stop("forced regeneration").await;
            let mut state = self.state.lock().await;
            state.retiring.push((Instant::now(), old));
        }
        let (handle, _lock) = self.provision(version, filtered, fp).await?;
        // Forced regeneration waits out readiness itself via the capture
        // timeout; nothing further to block on here.
        Ok(handle)
    }

    async fn wait_for_capacity(&self, priority: Priority, deadline: Instant) -> Result<(), PoolError> {
        let wait_start = Instant::now();
        let (wake_tx, wake_rx) = oneshot::channel();
        let seq = self.next_waiter_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock().await;
            state.wait_queue.push(Waiter {
                priority,
                seq,
                wake: wake_tx,
            });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = match tokio::time::timeout(remaining, wake_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(PoolError::NoCapacity),
        };
        self.metrics.queue_wait.record(wait_start.elapsed());
        result
    }

    fn wake_one_waiter(state: &mut PoolState) {
        while let Some(w) = state.wait_queue.pop() {
            if w.wake.send(()).is_ok() {
                return;
            }
            // Waiter already gave up; try the next one.
        }
    }

    async fn evict_worker_id(&self, id: WorkerId, reason: &str) {
        let handle = {
            let mut state = self.state.lock().await;
            let fp = state
                .workers
                .iter()
                .find(|(_, slot)| slot.handle.id == id)
                .map(|(fp, _)| *fp);
            let handle = fp.and_then(|fp| state.workers.remove(&fp)).map(|s| s.handle);
            Self::wake_one_waiter(&mut state);
            handle
        };
        if let Some(handle) = handle {
            handle.stop(reason.to_string()).await;
            self.metrics.inc_worker_evicted();
            self.metrics.emit(Event::WorkerEvicted {
                worker_id: id,
                reason: reason.to_string(),
            });
        }
    }

    async fn touch(&self, fp: Fingerprint) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.workers.get_mut(&fp) {
            slot.last_used = Instant::now();
        }
    }

    /// Pre-provisions (and waits for readiness of) a worker for each given
    /// option set, without submitting anything. Best-effort: one option
    /// set's failure to provision doesn't abort the rest, and results are
    /// returned in the same order the option sets were given.
    pub async fn warm_up(
        self: &Arc<Self>,
        option_sets: Vec<(CliVersion, RequestOptions)>,
    ) -> Vec<Result<Fingerprint, PoolError>> {
        let mut tasks = Vec::with_capacity(option_sets.len());
        for (version, options) in option_sets {
            let pool = self.clone();
            tasks.push(tokio::spawn(async move { pool.warm_up_one(version, &options).await }));
        }
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(task.await.unwrap_or_else(|e| {
                Err(PoolError::Internal(format!("warm-up task panicked: {e}")))
            }));
        }
        out
    }

    async fn warm_up_one(
        self: &Arc<Self>,
        version: CliVersion,
        options: &RequestOptions,
    ) -> Result<Fingerprint, PoolError> {
        let filtered = filter_options(version, options);
        validate_shapes(&filtered)?;
        let fp = fingerprint(version, &filtered);
        let deadline = Instant::now() + self.config.readiness_timeout;
        let (handle, _lock) = self
            .acquire_worker(version, &filtered, fp, Priority::Normal, deadline)
            .await?;
        handle.wait_until_ready(deadline).await?;
        Ok(fp)
    }

    /// Groups requests by fingerprint and runs each group's requests
    /// sequentially against the same warm worker, while distinct groups
    /// run concurrently. Requires an `Arc<Pool>` so each group's work can
    /// run on its own task.
    pub async fn batch_compile(
        self: &Arc<Self>,
        requests: Vec<CompileRequest>,
    ) -> Vec<Result<CompileResponse, PoolError>> {
        use std::collections::BTreeMap;

        let total = requests.len();
        let mut slots: Vec<Option<Result<CompileResponse, PoolError>>> =
            (0..total).map(|_| None).collect();
        let mut groups: BTreeMap<u64, Vec<(usize, CompileRequest)>> = BTreeMap::new();

        for (idx, req) in requests.into_iter().enumerate() {
            let filtered = filter_options(req.version, &req.options);
            match validate_shapes(&filtered) {
                Ok(()) => {
                    let fp = fingerprint(req.version, &filtered);
                    groups.entry(fp.0).or_default().push((idx, req));
                }
                Err(e) => slots[idx] = Some(Err(e)),
            }
        }
        self.metrics
            .inc_batch_group_by(groups.len() as u64);

        let mut group_fps = Vec::with_capacity(groups.len());
        let mut tasks = Vec::with_capacity(groups.len());
        for (fp_raw, group) in groups {
            group_fps.push(fp_raw);
            let pool = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut out = Vec::with_capacity(group.len());
                for (idx, req) in group {
                    out.push((idx, pool.compile(req).await));
                }
                out
            }));
        }

        for (fp_raw, task) in group_fps.into_iter().zip(tasks) {
            match task.await {
                Ok(group_results) => {
                    for (idx, result) in group_results {
                        slots[idx] = Some(result);
                    }
                }
                Err(e) => {
                    // A group task panicking mid-flight is the one invariant
                    // violation here with an identifiable culprit: the
                    // worker serving `fp_raw`, which may now be in whatever
                    // state the panic left it in.
                    tracing::error!(error = %e, fingerprint = fp_raw, "batch compile group task panicked");
                    self.metrics.emit(Event::MetricsSnapshot);
                    self.evict_worker_for_fingerprint(Fingerprint(fp_raw), "batch group task panicked")
                        .await;
                }
            }
        }

        slots
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    // No group ever claimed this index and no per-request
                    // filtering error was recorded for it either — an
                    // invariant violation with no single worker to blame.
                    tracing::error!("request missing from batch result after every group completed");
                    self.metrics.emit(Event::MetricsSnapshot);
                    Err(PoolError::Internal("request missing from batch result".into()))
                })
            })
            .collect()
    }

    /// Evicts whatever worker currently serves `fp`, regardless of its
    /// state. Used to recover from an invariant violation where a worker
    /// was left in an unknown state by a group task that panicked.
    async fn evict_worker_for_fingerprint(&self, fp: Fingerprint, reason: &str) {
        let handle = {
            let mut state = self.state.lock().await;
            let handle = state.workers.remove(&fp).map(|slot| slot.handle);
            Self::wake_one_waiter(&mut state);
            handle
        };
        if let Some(handle) = handle {
            let id = handle.id;
            handle.stop(reason.to_string()).await;
            self.metrics.inc_worker_evicted();
            self.metrics.emit(Event::WorkerEvicted {
                worker_id: id,
                reason: reason.to_string(),
            });
        }
    }

    pub async fn stats(&self) -> tailwind_pool_proto::MetricsSnapshot {
        let pool_size = self.state.lock().await.workers.len();
        let snapshot = tailwind_pool_proto::MetricsSnapshot {
            counters: self.metrics.counters_snapshot(),
            queue_wait: self.metrics.queue_wait.snapshot(),
            readiness_wait: self.metrics.readiness_wait.snapshot(),
            submit_to_output: self.metrics.submit_to_output.snapshot(),
            total: self.metrics.total.snapshot(),
            pool_size,
        };
        self.metrics.emit(Event::MetricsSnapshot);
        snapshot
    }

    fn spawn_idle_sweep(self: Arc<Self>) {
        let idle_after = self.config.idle_eviction_after;
        let grace = self.config.post_exit_grace;
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30).min(idle_after));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        self.sweep_idle(idle_after).await;
                        self.sweep_retiring(grace).await;
                    }
                }
            }
        });
    }

    async fn sweep_idle(&self, idle_after: Duration) {
        let candidates: Vec<(Fingerprint, WorkerId)> = {
            let state = self.state.lock().await;
            state
                .workers
                .iter()
                .filter(|(_, slot)| {
                    slot.handle.snapshot().state == WorkerState::Ready
                        && slot.last_used.elapsed() >= idle_after
                })
                .map(|(fp, slot)| (*fp, slot.handle.id))
                .collect()
        };
        for (fp, id) in candidates {
            let still_matches = {
                let mut state = self.state.lock().await;
                match state.workers.get(&fp) {
                    Some(slot) if slot.handle.id == id && slot.last_used.elapsed() >= idle_after => {
                        let slot = state.workers.remove(&fp).expect("just matched");
                        Self::wake_one_waiter(&mut state);
                        Some(slot.handle)
                    }
                    _ => None,
                }
            };
            if let Some(handle) = still_matches {
                handle.stop("idle eviction").await;
                self.metrics.inc_worker_evicted();
                self.metrics.emit(Event::WorkerEvicted {
                    worker_id: id,
                    reason: "idle eviction".into(),
                });
            }
        }
    }

    async fn sweep_retiring(&self, grace: Duration) {
        let mut state = self.state.lock().await;
        state.retiring.retain(|(since, _)| since.elapsed() < grace);
    }
}

fn find_lru_idle(workers: &HashMap<Fingerprint, Slot>) -> Option<WorkerId> {
    workers
        .values()
        .filter(|slot| slot.handle.snapshot().state == WorkerState::Ready)
        .min_by_key(|slot| slot.last_used)
        .map(|slot| slot.handle.id)
}

fn build_spec(version: CliVersion, filtered: &RequestOptions) -> WorkerSpec {
    let mut args = Vec::new();
    args_from_options(version, filtered, &mut args);
    WorkerSpec {
        program: "tailwindcss".to_string(),
        args,
        working_dir: None,
        env: Default::default(),
    }
}

fn args_from_options(version: CliVersion, filtered: &RequestOptions, args: &mut Vec<String>) {
    use tailwind_pool_proto::{OptionName::*, OptionValue};
    for (&name, value) in filtered.iter() {
        let flag = match (version, name) {
            (_, InputPath) => "--input",
            (_, OutputPath) => "--output",
            (CliVersion::V3, ContentGlobs) => "--content",
            (CliVersion::V3, ConfigPath) => "--config",
            (CliVersion::V3, Postcss) => "--postcss",
            (CliVersion::V3, Poll) => "--poll",
            (CliVersion::V3, NoAutoprefixer) => "--no-autoprefixer",
            (_, Minify) => "--minify",
            (_, Watch) => "--watch",
            (CliVersion::V4, Optimize) => "--optimize",
            (CliVersion::V4, WorkingDir) => "--cwd",
            (CliVersion::V4, SourceMap) => "--map",
            _ => continue,
        };
        match value {
            OptionValue::Bool(true) => args.push(flag.to_string()),
            OptionValue::Bool(false) => {}
            OptionValue::Str(s) => {
                args.push(flag.to_string());
                args.push(s.clone());
            }
            OptionValue::List(items) => {
                args.push(flag.to_string());
                args.push(items.join(","));
            }
        }
    }
}
