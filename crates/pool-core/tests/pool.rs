//! End-to-end tests against `Pool` using the in-process scripted launcher,
//! covering reuse, saturation/eviction, batching, and warm-up.

use std::sync::Arc;
use std::time::Duration;

use tailwind_pool_core::launcher::test_support::{Scripted, ScriptedLauncher};
use tailwind_pool_core::{CompileRequest, Launcher, Pool, PoolError};
use tailwind_pool_proto::{CliVersion, OptionName, OptionValue, PoolConfig, Priority, RequestOptions};

fn config(max_pool_size: usize) -> PoolConfig {
    PoolConfig {
        max_pool_size,
        compile_timeout: Duration::from_millis(300),
        readiness_timeout: Duration::from_millis(300),
        idle_eviction_after: Duration::from_secs(600),
        degraded_error_threshold: 3,
        active_cli_version: CliVersion::V4,
        capture_tier1_timeout: Duration::from_millis(150),
        capture_tier4_timeout: Duration::from_millis(60),
        post_exit_grace: Duration::from_millis(50),
    }
}

fn next_correlation_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn request(input: &str) -> CompileRequest {
    request_with_timeout(input, Duration::from_millis(300))
}

fn request_with_timeout(input: &str, timeout: Duration) -> CompileRequest {
    let mut options: RequestOptions = RequestOptions::new();
    options.insert(OptionName::InputPath, OptionValue::Str(input.to_string()));
    CompileRequest {
        version: CliVersion::V4,
        options,
        content: b"<div class=\"btn\">".to_vec(),
        output_path: None,
        priority: Priority::Normal,
        correlation_id: next_correlation_id(),
        deadline: std::time::Instant::now() + timeout,
    }
}

#[tokio::test(flavor = "current_thread")]
async fn reuses_worker_across_requests_with_same_fingerprint() {
    let launcher = Arc::new(ScriptedLauncher::new(vec![
        Scripted::StdoutLine("Done in 5ms.", Duration::from_millis(5)),
        Scripted::StdoutLine(".a{color:red}", Duration::from_millis(20)),
        Scripted::StdoutLine(".b{color:blue}", Duration::from_millis(60)),
    ]));
    let pool = Pool::new(config(2), launcher.clone());

    let first = pool.compile(request("a.css")).await.unwrap();
    assert_eq!(&*first.bytes, b".a{color:red}".as_slice());

    let second = pool.compile(request("a.css")).await.unwrap();
    assert_eq!(&*second.bytes, b".b{color:blue}".as_slice());
    assert_eq!(first.fingerprint, second.fingerprint);

    assert_eq!(*launcher.launched.lock().await, 1, "only one worker should have been launched");
    assert_eq!(pool.stats().await.pool_size, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn saturated_pool_evicts_idle_worker_for_new_fingerprint() {
    let launcher = Arc::new(ScriptedLauncher::new(vec![
        Scripted::StdoutLine("Done in 5ms.", Duration::from_millis(5)),
        Scripted::StdoutLine(".out{color:red}", Duration::from_millis(15)),
    ]));
    let pool = Pool::new(config(1), launcher.clone());

    let first = pool.compile(request("a.css")).await.unwrap();
    assert_eq!(&*first.bytes, b".out{color:red}".as_slice());
    // The worker that served "a.css" is idle (Ready) now; a request for a
    // different fingerprint should evict it rather than fail on capacity.
    let second = pool.compile(request("b.css")).await.unwrap();
    assert_eq!(&*second.bytes, b".out{color:red}".as_slice());

    assert_eq!(*launcher.launched.lock().await, 2);
    assert_eq!(pool.stats().await.pool_size, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn saturated_pool_without_idle_candidate_times_out() {
    // An empty script: the worker never emits a readiness line and never
    // exits, so it occupies the pool's single slot in `Starting` forever.
    let launcher: Arc<dyn Launcher> = Arc::new(ScriptedLauncher::new(vec![]));
    let pool = Pool::new(config(1), launcher);

    let pool_bg = pool.clone();
    let stuck = tokio::spawn(async move { pool_bg.compile(request("a.css")).await });
    // Give the background request time to provision its worker and claim
    // the pool's only slot before the second request is attempted.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = pool.compile(request("b.css")).await;
    assert!(matches!(result, Err(PoolError::NoCapacity)), "expected NoCapacity, got {result:?}");

    let _ = stuck.await;
}

#[tokio::test(flavor = "current_thread")]
async fn batch_compile_runs_distinct_fingerprints_concurrently() {
    let launcher = Arc::new(ScriptedLauncher::new(vec![
        Scripted::StdoutLine("Done in 5ms.", Duration::from_millis(5)),
        Scripted::StdoutLine(".shared{color:red}", Duration::from_millis(20)),
    ]));
    let pool = Pool::new(config(4), launcher.clone());

    let results = pool
        .batch_compile(vec![request("a.css"), request("b.css"), request("a.css")])
        .await;

    assert_eq!(results.len(), 3);
    for r in &results {
        let r = r.as_ref().unwrap();
        assert_eq!(&*r.bytes, b".shared{color:red}".as_slice());
    }
    // Two distinct fingerprints (a.css, b.css) means two workers, no matter
    // how many requests shared a fingerprint.
    assert_eq!(*launcher.launched.lock().await, 2);
    assert_eq!(pool.metrics().counters_snapshot().batch_groups, 2);
}

#[tokio::test(flavor = "current_thread")]
async fn batch_compile_keeps_invalid_requests_isolated() {
    let launcher = Arc::new(ScriptedLauncher::new(vec![Scripted::StdoutLine(
        "Done in 5ms.",
        Duration::from_millis(5),
    )]));
    let pool = Pool::new(config(4), launcher);

    let mut bad = request("a.css");
    bad.options.insert(OptionName::Minify, OptionValue::Str("yes".into()));

    let results = pool.batch_compile(vec![bad]).await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(PoolError::InvalidArgs(_))));
}

#[tokio::test(flavor = "current_thread")]
async fn warm_up_provisions_without_submitting_content() {
    let launcher = Arc::new(ScriptedLauncher::new(vec![
        Scripted::StdoutLine("Done in 5ms.", Duration::from_millis(5)),
        Scripted::StdoutLine(".a{color:red}", Duration::from_millis(40)),
    ]));
    let pool = Pool::new(config(2), launcher.clone());

    let mut options: RequestOptions = RequestOptions::new();
    options.insert(OptionName::InputPath, OptionValue::Str("a.css".into()));
    let results = pool.warm_up(vec![(CliVersion::V4, options)]).await;
    assert_eq!(results.len(), 1);
    let fp = results[0].as_ref().unwrap();

    assert_eq!(*launcher.launched.lock().await, 1);
    let compiled = pool.compile(request("a.css")).await.unwrap();
    assert_eq!(compiled.fingerprint, *fp);
    // warm_up's worker should have been reused, not a second one launched.
    assert_eq!(*launcher.launched.lock().await, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn warm_up_is_best_effort_across_a_list() {
    // The first option set provisions fine; the second carries a value
    // shape its option could never legally take. One bad entry must not
    // abort the rest of the batch.
    let launcher = Arc::new(ScriptedLauncher::new(vec![
        Scripted::StdoutLine("Done in 5ms.", Duration::from_millis(5)),
    ]));
    let pool = Pool::new(config(2), launcher.clone());

    let mut good: RequestOptions = RequestOptions::new();
    good.insert(OptionName::InputPath, OptionValue::Str("a.css".into()));

    let mut bad: RequestOptions = RequestOptions::new();
    bad.insert(OptionName::Minify, OptionValue::Str("yes".into()));

    let results = pool
        .warm_up(vec![(CliVersion::V4, good), (CliVersion::V4, bad)])
        .await;
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(PoolError::InvalidArgs(_))));
}

#[tokio::test(flavor = "current_thread")]
async fn per_request_deadline_governs_over_pool_compile_timeout() {
    // The pool's own `compile_timeout` is generous (300ms, see `config`),
    // but this request's own deadline is much tighter than the worker's
    // scripted 500ms delay to its burst — the per-request deadline, not the
    // pool-wide config, must be what gives up first.
    let launcher = Arc::new(ScriptedLauncher::new(vec![
        Scripted::StdoutLine("Done in 5ms.", Duration::from_millis(5)),
        Scripted::StdoutLine(".slow{color:red}", Duration::from_millis(500)),
    ]));
    let pool = Pool::new(config(2), launcher);

    let started = std::time::Instant::now();
    let result = pool.compile(request_with_timeout("a.css", Duration::from_millis(50))).await;
    assert!(result.is_err(), "expected the short per-request deadline to be hit, got {result:?}");
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "per-request deadline should have fired well before the pool's own compile_timeout"
    );
}
