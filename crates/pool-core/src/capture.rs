//! C6: Output Capture Protocol.
//!
//! Four tiers, tried in order, each one a fallback for the one before it
//! having failed to observe output that may well have already been
//! produced. The protocol exists because a subprocess that writes its
//! result and exits in the same scheduling quantum can beat the listener
//! registration that was supposed to observe it — the central race this
//! whole pool is built around avoiding, and the reason `Worker` preserves
//! its last burst ([`WorkerSnapshot::preserved_output`]) instead of
//! discarding it the moment the in-memory listener is notified.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tailwind_pool_proto::CaptureMethod;
use tokio::time::timeout;

use crate::error::PoolError;
use crate::worker::{WorkerFailure, WorkerHandle, WorkerOutcome};

pub struct CaptureConfig<'a> {
    pub tier1_timeout: Duration,
    pub tier4_timeout: Duration,
    /// Where tier 2 looks for the compiled result on disk, if the request
    /// carried an output path.
    pub output_path: Option<&'a Path>,
}

pub struct CaptureOutcome {
    pub bytes: Arc<[u8]>,
    pub method: CaptureMethod,
}

/// Runs the capture protocol for one submission already in flight on
/// `worker`, given the `oneshot::Receiver` [`WorkerHandle::submit`] handed
/// back.
///
/// `submission_generation` is the worker's `outputs_total` counter captured
/// at the moment this submission's listener was registered (the second
/// element of `WorkerHandle::submit`'s return value). Tier 3 only trusts
/// `preserved_output` if the worker's *current* `outputs_total` is strictly
/// greater than this — otherwise the preserved burst predates this
/// submission and handing it back would silently deliver stale output.
///
/// `respawn` is called only for tier 4 (forced regeneration); it provisions
/// a brand-new worker for the same fingerprint and returns its handle, so
/// this module never has to know how workers are created.
pub async fn capture<F, Fut>(
    worker: &WorkerHandle,
    burst_rx: tokio::sync::oneshot::Receiver<WorkerOutcome>,
    submission_generation: u64,
    request_id: u64,
    content: Vec<u8>,
    cfg: &CaptureConfig<'_>,
    respawn: F,
) -> Result<CaptureOutcome, PoolError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<WorkerHandle, PoolError>>,
{
    // Tier 1: the listener we registered before submitting fires in time.
    match timeout(cfg.tier1_timeout, burst_rx).await {
        Ok(Ok(WorkerOutcome::Burst(bytes))) => {
            return Ok(CaptureOutcome {
                bytes,
                method: CaptureMethod::Immediate,
            });
        }
        Ok(Ok(WorkerOutcome::Failed(WorkerFailure::ExitBeforeOutput))) => {
            // Fall through: the worker may still have written to disk or
            // kept a preserved burst despite the channel reporting failure.
        }
        Ok(Ok(WorkerOutcome::Failed(_))) | Ok(Err(_)) => {
            // Channel closed or startup failed outright; still worth trying
            // the filesystem and preserved-state tiers before giving up.
        }
        Err(_) => {
            // Timed out; the worker may finish the write after we stop
            // waiting on the channel. Tiers 2 and 3 cover that case.
        }
    }

    // Tier 2: read the output path directly, in case the subprocess wrote
    // the file before (or instead of) delivering the in-memory burst.
    if let Some(path) = cfg.output_path {
        if let Ok(bytes) = tokio::fs::read(path).await {
            if !bytes.is_empty() {
                return Ok(CaptureOutcome {
                    bytes: Arc::from(bytes.into_boxed_slice()),
                    method: CaptureMethod::FileBased,
                });
            }
        }
    }

    // Tier 3: the worker object is (momentarily) still alive and may have
    // preserved the exact burst that raced the listener. Only trust it if
    // it is newer than this submission's own generation — otherwise it is
    // leftover output from a previous submission to the same worker, and
    // handing it back here would be silently stale.
    let snapshot = worker.snapshot();
    if snapshot.counters.outputs_total > submission_generation {
        if let Some(bytes) = snapshot.preserved_output {
            if !bytes.is_empty() {
                return Ok(CaptureOutcome {
                    bytes,
                    method: CaptureMethod::PreservedState,
                });
            }
        }
    }

    // Tier 4: provision a fresh worker and retry exactly once. A second
    // failure surfaces as `EmptyOutput` rather than recursing.
    let fresh = respawn().await?;
    let (retry_rx, _generation) = fresh
        .submit(request_id, content)
        .await
        .map_err(|_| PoolError::EmptyOutput)?;
    match timeout(cfg.tier4_timeout, retry_rx).await {
        Ok(Ok(WorkerOutcome::Burst(bytes))) if !bytes.is_empty() => Ok(CaptureOutcome {
            bytes,
            method: CaptureMethod::ForcedRegeneration,
        }),
        _ => Err(PoolError::EmptyOutput),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::test_support::{Scripted, ScriptedLauncher};
    use crate::launcher::Launcher;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tailwind_pool_proto::{Fingerprint, WorkerId};

    fn next_id() -> WorkerId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        WorkerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    async fn spawn_fake(script: Vec<Scripted>) -> WorkerHandle {
        let launcher = ScriptedLauncher::new(script);
        let process = launcher
            .launch(&crate::launcher::WorkerSpec {
                program: "tailwindcss".into(),
                args: vec![],
                working_dir: None,
                env: Default::default(),
            })
            .await
            .unwrap();
        crate::worker::spawn_worker(
            next_id(),
            Fingerprint(0),
            process,
            Duration::from_secs(5),
            3,
            |_| {},
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tier1_immediate_capture() {
        let worker = spawn_fake(vec![
            Scripted::StdoutLine("Done in 12ms.", Duration::from_millis(1)),
            Scripted::StdoutLine(".btn{color:red}", Duration::from_millis(50)),
        ])
        .await;
        // Wait for readiness, then submit before the scripted burst fires so
        // the listener is registered in time to observe it.
        tokio::time::sleep(Duration::from_millis(15)).await;
        let (rx, generation) = worker.submit(1, b"<div class=\"btn\">".to_vec()).await.unwrap();
        let cfg = CaptureConfig {
            tier1_timeout: Duration::from_secs(1),
            tier4_timeout: Duration::from_millis(500),
            output_path: None,
        };
        let outcome = capture(&worker, rx, generation, 1, vec![], &cfg, || async {
            unreachable!("tier 1 should have succeeded")
        })
        .await
        .unwrap();
        assert_eq!(outcome.method, CaptureMethod::Immediate);
        assert_eq!(&*outcome.bytes, b".btn{color:red}".as_slice());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tier2_reads_output_path_when_listener_misses_it() {
        // The worker never emits a burst line at all (only a readiness
        // marker), so tier 1 must time out before tier 2 gets a chance; the
        // file is what a real `tailwindcss --output` run would have written.
        let worker = spawn_fake(vec![Scripted::StdoutLine(
            "Done in 5ms.",
            Duration::from_millis(1),
        )])
        .await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        let (rx, generation) = worker.submit(1, b"<div class=\"btn\">".to_vec()).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let output_path = dir.path().join("out.css");
        tokio::fs::write(&output_path, b".btn{color:red}").await.unwrap();

        let cfg = CaptureConfig {
            tier1_timeout: Duration::from_millis(20),
            tier4_timeout: Duration::from_millis(200),
            output_path: Some(&output_path),
        };
        let outcome = capture(&worker, rx, generation, 1, vec![], &cfg, || async {
            unreachable!("tier 2 should have succeeded")
        })
        .await
        .unwrap();
        assert_eq!(outcome.method, CaptureMethod::FileBased);
        assert_eq!(&*outcome.bytes, b".btn{color:red}".as_slice());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tier3_preserved_state_after_race() {
        // The worker emits the burst and exits essentially immediately,
        // racing the listener registration that should observe it.
        let worker = spawn_fake(vec![
            Scripted::StdoutLine(".btn{color:red}", Duration::from_millis(1)),
            Scripted::Exit(0, Duration::from_millis(2)),
        ])
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        // By now the worker has already exited and delivered the burst to
        // no one (nothing had submitted yet); preserved_output still holds it.
        let snapshot = worker.snapshot();
        assert!(snapshot.preserved_output.is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tier3_does_not_return_a_stale_preserved_burst() {
        // First submission completes normally and leaves its burst
        // preserved. A second submission to the same (reused) worker must
        // not be handed that stale burst just because its own fresh output
        // hasn't arrived by the time tier 1 gives up.
        let worker = spawn_fake(vec![
            Scripted::StdoutLine("Done in 5ms.", Duration::from_millis(1)),
            Scripted::StdoutLine(".old{color:red}", Duration::from_millis(10)),
            Scripted::StdoutLine(".new{color:blue}", Duration::from_millis(500)),
        ])
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (first_rx, first_gen) = worker.submit(1, b"<div class=\"old\">".to_vec()).await.unwrap();
        assert_eq!(first_gen, 0);
        match first_rx.await.unwrap() {
            WorkerOutcome::Burst(bytes) => assert_eq!(&*bytes, b".old{color:red}".as_slice()),
            other => panic!("expected a burst, got {other:?}"),
        }

        // The second submission's own output is 500ms away, well past tier
        // 1's timeout below; the only way to see `.new` is tier 4's retry.
        let (second_rx, second_gen) = worker.submit(2, b"<div class=\"new\">".to_vec()).await.unwrap();
        assert_eq!(second_gen, 1, "generation must be captured at this submission's own registration");

        let fresh = spawn_fake(vec![
            Scripted::StdoutLine("Done in 1ms.", Duration::from_millis(1)),
            Scripted::StdoutLine(".new{color:blue}", Duration::from_millis(5)),
        ])
        .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cfg = CaptureConfig {
            tier1_timeout: Duration::from_millis(15),
            tier4_timeout: Duration::from_millis(200),
            output_path: None,
        };
        let outcome = capture(&worker, second_rx, second_gen, 2, vec![], &cfg, || async { Ok(fresh) })
            .await
            .unwrap();
        assert_eq!(&*outcome.bytes, b".new{color:blue}".as_slice());
        assert_ne!(
            outcome.method,
            CaptureMethod::PreservedState,
            "must not have returned the first submission's stale burst"
        );
    }
}
