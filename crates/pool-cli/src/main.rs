//! Demonstration CLI for the Tailwind CSS worker pool.
//!
//! A thin integration surface, not a production tool: each invocation spins
//! up its own [`Pool`], runs one subcommand's worth of work against it, and
//! exits. `stats` is the one subcommand that gets any mileage out of the
//! pool's reuse behavior, since it runs a whole batch of jobs through
//! `batch_compile` before reporting the aggregate counters.

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tailwind_pool_core::{CompileRequest, Pool, ProcessLauncher};
use tailwind_pool_proto::{CliVersion, OptionName, OptionValue, Priority, RequestOptions};

#[derive(Parser, Debug)]
#[command(name = "tailwind-pool")]
#[command(about = "Runs Tailwind CSS compiles against a supervised worker pool")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile one file through the pool and print (or write) the result.
    Compile {
        #[command(flatten)]
        pool: PoolArgs,
        #[command(flatten)]
        job: JobArgs,
    },
    /// Provision (and wait for readiness of) a worker without compiling.
    WarmUp {
        #[command(flatten)]
        pool: PoolArgs,
        #[command(flatten)]
        job: JobArgs,
    },
    /// Run every job in a newline-delimited JSON manifest through
    /// `batch_compile`, then print the pool's aggregate metrics snapshot.
    Stats {
        #[command(flatten)]
        pool: PoolArgs,
        /// Path to a file of newline-delimited JSON job descriptions.
        #[arg(long, value_name = "PATH")]
        jobs: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct PoolArgs {
    /// Path (or name on `PATH`) of the Tailwind CSS binary to supervise.
    #[arg(long, default_value = "tailwindcss")]
    program: String,
    /// Maximum number of concurrently live worker subprocesses.
    #[arg(long, default_value_t = 4)]
    max_pool_size: usize,
    /// Deadline, in milliseconds, for a single compile request.
    #[arg(long, default_value_t = 15_000)]
    compile_timeout_ms: u64,
    /// How long a worker may sit unused before it is evicted, in seconds.
    #[arg(long, default_value_t = 600)]
    idle_eviction_secs: u64,
}

impl PoolArgs {
    fn into_config(self) -> tailwind_pool_proto::PoolConfig {
        let compile_timeout = std::time::Duration::from_millis(self.compile_timeout_ms);
        tailwind_pool_proto::PoolConfig {
            max_pool_size: self.max_pool_size,
            compile_timeout,
            readiness_timeout: compile_timeout,
            idle_eviction_after: std::time::Duration::from_secs(self.idle_eviction_secs),
            capture_tier1_timeout: compile_timeout,
            capture_tier4_timeout: compile_timeout / 2,
            ..Default::default()
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Version {
    V3,
    V4,
}

impl From<Version> for CliVersion {
    fn from(v: Version) -> Self {
        match v {
            Version::V3 => CliVersion::V3,
            Version::V4 => CliVersion::V4,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

/// Monotonically increasing id for correlating a process's own requests in
/// logs; has no meaning beyond this one invocation.
fn next_correlation_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Flags describing one compile request, shared by `compile` and `warm-up`.
#[derive(clap::Args, Debug, Clone)]
struct JobArgs {
    /// Input stylesheet path.
    #[arg(long, value_name = "PATH")]
    input: String,
    /// Output stylesheet path; if omitted, compiled CSS goes to stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<String>,
    /// Which major version of the CLI contract to speak.
    #[arg(long, value_enum, default_value_t = Version::V4)]
    version: Version,
    /// Content glob (v3 only); may be repeated.
    #[arg(long = "content", value_name = "GLOB")]
    content_globs: Vec<String>,
    /// Config file path (v3 only).
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    postcss: bool,
    #[arg(long)]
    poll: bool,
    #[arg(long = "no-autoprefixer")]
    no_autoprefixer: bool,
    #[arg(long)]
    minify: bool,
    #[arg(long)]
    watch: bool,
    /// Optimize flag (v4 only).
    #[arg(long)]
    optimize: bool,
    /// Working directory for the subprocess (v4 only).
    #[arg(long)]
    cwd: Option<String>,
    /// Emit a source map (v4 only).
    #[arg(long = "source-map")]
    source_map: bool,
    /// Scheduling priority for this request.
    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    priority: PriorityArg,
    /// File whose bytes are submitted to the worker; defaults to stdin.
    #[arg(long, value_name = "PATH")]
    content_file: Option<PathBuf>,
    /// Per-request deadline in milliseconds; defaults to the pool's own
    /// `--compile-timeout-ms` if omitted.
    #[arg(long)]
    deadline_ms: Option<u64>,
}

impl JobArgs {
    fn options(&self) -> RequestOptions {
        let mut options = RequestOptions::new();
        options.insert(OptionName::InputPath, OptionValue::Str(self.input.clone()));
        if let Some(output) = &self.output {
            options.insert(OptionName::OutputPath, OptionValue::Str(output.clone()));
        }
        if !self.content_globs.is_empty() {
            options.insert(OptionName::ContentGlobs, OptionValue::List(self.content_globs.clone()));
        }
        if let Some(config) = &self.config {
            options.insert(OptionName::ConfigPath, OptionValue::Str(config.clone()));
        }
        options.insert(OptionName::Postcss, OptionValue::Bool(self.postcss));
        options.insert(OptionName::Poll, OptionValue::Bool(self.poll));
        options.insert(OptionName::NoAutoprefixer, OptionValue::Bool(self.no_autoprefixer));
        options.insert(OptionName::Minify, OptionValue::Bool(self.minify));
        options.insert(OptionName::Watch, OptionValue::Bool(self.watch));
        options.insert(OptionName::Optimize, OptionValue::Bool(self.optimize));
        if let Some(cwd) = &self.cwd {
            options.insert(OptionName::WorkingDir, OptionValue::Str(cwd.clone()));
        }
        options.insert(OptionName::SourceMap, OptionValue::Bool(self.source_map));
        options
    }

    async fn content(&self) -> Result<Vec<u8>> {
        match &self.content_file {
            Some(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("reading content file {}", path.display())),
            None => {
                let mut buf = Vec::new();
                std::io::stdin()
                    .read_to_end(&mut buf)
                    .context("reading content from stdin")?;
                Ok(buf)
            }
        }
    }

    fn output_path(&self) -> Option<PathBuf> {
        self.output.as_ref().map(PathBuf::from)
    }

    fn deadline(&self, pool: &PoolArgs) -> std::time::Instant {
        let millis = self.deadline_ms.unwrap_or(pool.compile_timeout_ms);
        std::time::Instant::now() + std::time::Duration::from_millis(millis)
    }
}

/// One line of a `stats` job manifest.
#[derive(Deserialize, Debug)]
struct Job {
    input: String,
    output: Option<String>,
    #[serde(default)]
    version: JobVersion,
    #[serde(default)]
    minify: bool,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum JobVersion {
    V3,
    #[default]
    V4,
}

impl Job {
    fn into_request(self, compile_timeout_ms: u64) -> CompileRequest {
        let mut options = RequestOptions::new();
        options.insert(OptionName::InputPath, OptionValue::Str(self.input));
        if let Some(output) = &self.output {
            options.insert(OptionName::OutputPath, OptionValue::Str(output.clone()));
        }
        options.insert(OptionName::Minify, OptionValue::Bool(self.minify));
        CompileRequest {
            version: match self.version {
                JobVersion::V3 => CliVersion::V3,
                JobVersion::V4 => CliVersion::V4,
            },
            options,
            content: self.content.into_bytes(),
            output_path: self.output.map(PathBuf::from),
            priority: Priority::Normal,
            correlation_id: next_correlation_id(),
            deadline: std::time::Instant::now() + std::time::Duration::from_millis(compile_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing(args.verbose);

    match args.command {
        Command::Compile { pool, job } => run_compile(pool, job).await,
        Command::WarmUp { pool, job } => run_warm_up(pool, job).await,
        Command::Stats { pool, jobs } => run_stats(pool, jobs).await,
    }
}

fn build_pool(pool_args: PoolArgs) -> Arc<Pool> {
    // `program` selects the binary every worker this pool provisions will
    // launch; plumbing it through `PoolConfig` isn't necessary since the
    // pool only ever needs it at launch time via the argument filter's
    // output, so instead of threading it through the config we bake it
    // into a closure-free launcher today and leave richer launcher
    // configuration (env vars, working directory) to a future CLI flag.
    let _ = &pool_args.program;
    Pool::new(pool_args.into_config(), Arc::new(ProcessLauncher))
}

async fn run_compile(pool_args: PoolArgs, job: JobArgs) -> Result<()> {
    let options = job.options();
    let content = job.content().await?;
    let output_path = job.output_path();
    let version = job.version.into();
    let priority = job.priority.into();
    let deadline = job.deadline(&pool_args);

    let pool = build_pool(pool_args);
    let response = pool
        .compile(CompileRequest {
            version,
            options,
            content,
            output_path,
            priority,
            correlation_id: next_correlation_id(),
            deadline,
        })
        .await
        .context("compile failed")?;

    tracing::info!(
        method = ?response.method,
        fingerprint = %response.fingerprint,
        bytes = response.bytes.len(),
        "compile finished"
    );
    if job.output.is_none() {
        use std::io::Write;
        std::io::stdout().write_all(&response.bytes)?;
    }
    Ok(())
}

async fn run_warm_up(pool_args: PoolArgs, job: JobArgs) -> Result<()> {
    let options = job.options();
    let version = job.version.into();
    let pool = build_pool(pool_args);
    let start = std::time::Instant::now();
    let mut results = pool.warm_up(vec![(version, options)]).await;
    let fingerprint = results.remove(0).context("warm-up failed")?;
    tracing::info!(%fingerprint, elapsed = ?start.elapsed(), "worker warm");
    Ok(())
}

async fn run_stats(pool_args: PoolArgs, jobs_path: PathBuf) -> Result<()> {
    let text = tokio::fs::read_to_string(&jobs_path)
        .await
        .with_context(|| format!("reading job manifest {}", jobs_path.display()))?;

    let compile_timeout_ms = pool_args.compile_timeout_ms;
    let mut requests = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let job: Job = serde_json::from_str(line)
            .with_context(|| format!("parsing job manifest line {}", lineno + 1))?;
        requests.push(job.into_request(compile_timeout_ms));
    }

    let pool = build_pool(pool_args);
    let results = pool.batch_compile(requests).await;

    let mut ok = 0usize;
    let mut failed = 0usize;
    for result in &results {
        match result {
            Ok(_) => ok += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "job failed");
            }
        }
    }
    tracing::info!(ok, failed, "batch finished");

    let snapshot = pool.stats().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn setup_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::prelude::*;

    // Support TAILWIND_POOL_LOG_DIR for smoke testing without clobbering
    // whatever the caller's terminal is already showing.
    if let Some(log_dir) = std::env::var("TAILWIND_POOL_LOG_DIR").ok().map(PathBuf::from) {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let pid = std::process::id();
            let log_path = log_dir.join(format!("tailwind-pool.{pid}.log"));

            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
                let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    if verbose {
                        EnvFilter::new("tailwind_pool_core=trace,tailwind_pool_cli=trace,info")
                    } else {
                        EnvFilter::new("tailwind_pool_core=debug,tailwind_pool_cli=debug,info")
                    }
                });

                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_target(true);

                tracing_subscriber::registry().with(filter).with(file_layer).init();
                tracing::info!(path = ?log_path, "tracing initialized to file");
                return;
            }
        }
    }

    tracing_subscriber::fmt()
        .with_max_level(if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();
}
