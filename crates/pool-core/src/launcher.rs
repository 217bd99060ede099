//! C8: Launcher abstraction.
//!
//! A [`Launcher`] turns a [`WorkerSpec`] into a running subprocess's three
//! I/O halves. The pool is generic over it so tests can swap in an
//! in-process fake ([`test_support::ScriptedLauncher`]) instead of spawning
//! a real `tailwindcss` binary, the same split the teacher uses between
//! `ProcessLauncher` and its `test_helpers::TestLauncher`.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use crate::error::PoolError;

/// Everything needed to start one worker subprocess.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// A spawned subprocess, split into the halves the worker actor needs.
///
/// Boxed trait objects rather than concrete `tokio::process` types so the
/// fake launcher can hand back in-memory pipes with identical call shapes.
pub struct LaunchedProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn ProcessHandle>,
}

/// The subset of `tokio::process::Child` the worker actor needs: wait for
/// exit, or kill on demand. A trait so the fake launcher can implement it
/// without a real OS process backing it.
#[async_trait]
pub trait ProcessHandle: Send {
    async fn wait(&mut self) -> std::io::Result<i32>;
    async fn start_kill(&mut self) -> std::io::Result<()>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedProcess, PoolError>;
}

/// Spawns the real `tailwindcss` binary (or whatever `spec.program` names).
pub struct ProcessLauncher;

#[async_trait]
impl ProcessHandle for tokio::process::Child {
    async fn wait(&mut self) -> std::io::Result<i32> {
        let status = tokio::process::Child::wait(self).await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn start_kill(&mut self) -> std::io::Result<()> {
        tokio::process::Child::start_kill(self)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<LaunchedProcess, PoolError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PoolError::StartupFailed(format!("spawn {}: {e}", spec.program)))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        Ok(LaunchedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(child),
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! An in-process fake subprocess for deterministic, spawn-free tests.
    //!
    //! A [`ScriptedLauncher`] hands every launched worker a scripted line
    //! sequence instead of a real `tailwindcss` binary: lines feed into the
    //! worker's stdout reader on a timer, and a oneshot channel plays the
    //! part of the child's exit status.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::sync::{oneshot, Mutex};

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        /// Emit a stdout line after a delay, then wait for the next step.
        StdoutLine(&'static str, Duration),
        /// Emit a stderr line after a delay.
        StderrLine(&'static str, Duration),
        /// Exit with the given code after a delay.
        Exit(i32, Duration),
        /// Never exit and never emit anything until killed.
        Hang,
    }

    struct FakeHandle {
        exit_rx: oneshot::Receiver<i32>,
        kill_rx: oneshot::Receiver<()>,
        kill_tx: Option<oneshot::Sender<()>>,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        // Awaits `&mut self.exit_rx` / `&mut self.kill_rx` (rather than
        // consuming either via `take()`) so repeated calls across `select!`
        // iterations — most of which get cancelled without this branch ever
        // winning — keep polling the same receivers instead of losing a
        // signal the first time this future is created and dropped
        // unresolved. `kill_rx` is what makes a scripted worker with no
        // `Exit` step actually respond to `start_kill`, the same way a real
        // subprocess's `wait()` resolves once it's been signaled.
        async fn wait(&mut self) -> std::io::Result<i32> {
            let exit = async {
                match (&mut self.exit_rx).await {
                    Ok(code) => code,
                    Err(_) => std::future::pending().await,
                }
            };
            tokio::select! {
                code = exit => Ok(code),
                _ = &mut self.kill_rx => Ok(-1),
            }
        }

        async fn start_kill(&mut self) -> std::io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            if let Some(tx) = self.kill_tx.take() {
                let _ = tx.send(());
            }
            Ok(())
        }
    }

    /// Launches fakes that follow a fixed script, ignoring the real `spec`.
    pub struct ScriptedLauncher {
        script: Vec<Scripted>,
        pub launched: Arc<Mutex<u32>>,
    }

    impl ScriptedLauncher {
        pub fn new(script: Vec<Scripted>) -> Self {
            Self {
                script,
                launched: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl Launcher for ScriptedLauncher {
        async fn launch(&self, _spec: &WorkerSpec) -> Result<LaunchedProcess, PoolError> {
            *self.launched.lock().await += 1;

            let (stdin_here, stdin_there) = duplex(4096);
            let (mut stdout_here, stdout_there) = duplex(8192);
            let (mut stderr_here, stderr_there) = duplex(8192);
            let (exit_tx, exit_rx) = oneshot::channel();
            let (kill_tx, kill_rx) = oneshot::channel();
            let killed = Arc::new(AtomicBool::new(false));

            let script = self.script.clone();
            let killed_task = killed.clone();
            tokio::spawn(async move {
                for step in script {
                    if killed_task.load(Ordering::SeqCst) {
                        return;
                    }
                    match step {
                        Scripted::StdoutLine(line, delay) => {
                            tokio::time::sleep(delay).await;
                            let mut buf = line.as_bytes().to_vec();
                            buf.push(b'\n');
                            if stdout_here.write_all(&buf).await.is_err() {
                                return;
                            }
                        }
                        Scripted::StderrLine(line, delay) => {
                            tokio::time::sleep(delay).await;
                            let mut buf = line.as_bytes().to_vec();
                            buf.push(b'\n');
                            if stderr_here.write_all(&buf).await.is_err() {
                                return;
                            }
                        }
                        Scripted::Exit(code, delay) => {
                            tokio::time::sleep(delay).await;
                            let _ = exit_tx.send(code);
                            return;
                        }
                        Scripted::Hang => {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            });
            // The fake never reads submitted content back, but it must keep
            // draining `stdin_here` so writes into `stdin_there` don't fail
            // with a broken pipe once the internal buffer fills up.
            let mut stdin_sink = stdin_here;
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdin_sink, &mut tokio::io::sink()).await;
            });

            Ok(LaunchedProcess {
                stdin: Box::new(stdin_there),
                stdout: Box::new(stdout_there),
                stderr: Box::new(stderr_there),
                handle: Box::new(FakeHandle {
                    exit_rx,
                    kill_rx,
                    kill_tx: Some(kill_tx),
                    killed,
                }),
            })
        }
    }
}
