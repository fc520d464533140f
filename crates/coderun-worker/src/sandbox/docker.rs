// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker sandbox executor.
//!
//! Drives the `docker` CLI. Each sandbox is one container:
//! - `docker create` with the source directory bind-mounted read-only
//! - `docker start --attach --interactive` to feed stdin and stream output
//! - `docker inspect` for the exit code and OOM flag
//! - `docker rm --force` on dispose
//!
//! Source files live in a temporary directory on the host that is removed
//! together with the sandbox.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::*;

/// Parse an env var into a bool with a sensible default.
fn parse_env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Docker executor configuration
#[derive(Debug, Clone)]
pub struct DockerSandboxConfig {
    /// Path or name of the docker CLI
    pub docker_bin: String,
    /// Prefix for container names
    pub name_prefix: String,
    /// Parent directory for per-sandbox source directories (system temp dir when unset)
    pub work_root: Option<PathBuf>,
    /// Disable container networking
    pub network_disabled: bool,
    /// Output lines kept per sandbox; the rest is drained and dropped
    pub max_log_lines: usize,
}

impl Default for DockerSandboxConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            name_prefix: "coderun".to_string(),
            work_root: None,
            network_disabled: true,
            max_log_lines: 10_000,
        }
    }
}

impl DockerSandboxConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            docker_bin: std::env::var("CODERUN_DOCKER_BIN").unwrap_or(defaults.docker_bin),
            name_prefix: std::env::var("CODERUN_CONTAINER_PREFIX")
                .unwrap_or(defaults.name_prefix),
            work_root: std::env::var("CODERUN_SANDBOX_TMPDIR").ok().map(PathBuf::from),
            network_disabled: parse_env_bool("CODERUN_SANDBOX_NETWORK_DISABLED", true),
            max_log_lines: std::env::var("CODERUN_MAX_LOG_LINES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_log_lines),
        }
    }
}

/// Sandbox executor backed by the docker CLI.
pub struct DockerSandboxExecutor {
    config: DockerSandboxConfig,
}

impl DockerSandboxExecutor {
    /// Create a new docker executor
    pub fn new(config: DockerSandboxConfig) -> Self {
        Self { config }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(DockerSandboxConfig::from_env())
    }

    /// Arguments for `docker create`.
    fn create_args(&self, name: &str, source_dir: &str, spec: &SandboxSpec) -> Vec<String> {
        let profile = &spec.profile;
        let limits = &spec.limits;
        let memory = format!("{}m", limits.memory_mb);
        let workdir = profile.workdir.display().to_string();

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--interactive".to_string(),
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--cpus".to_string(),
            limits.cpu_count.to_string(),
            "--pids-limit".to_string(),
            limits.pids_limit.to_string(),
            "--volume".to_string(),
            format!("{source_dir}:{workdir}:ro"),
            "--workdir".to_string(),
            workdir,
        ];
        if self.config.network_disabled {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        if let Some(user) = &profile.user {
            args.extend(["--user".to_string(), user.clone()]);
        }
        args.push(profile.image.clone());
        args.extend(profile.command.iter().cloned());
        args
    }
}

#[async_trait]
impl SandboxExecutor for DockerSandboxExecutor {
    fn executor_type(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>> {
        for file in &spec.files {
            file.validate()?;
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("coderun-");
        let source_dir = match &self.config.work_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        for file in &spec.files {
            tokio::fs::write(source_dir.path().join(&file.name), &file.content).await?;
        }

        let name = format!(
            "{}-{}",
            self.config.name_prefix,
            uuid::Uuid::new_v4().simple()
        );
        let args = self.create_args(&name, &source_dir.path().display().to_string(), &spec);
        let output = Command::new(&self.config.docker_bin)
            .args(&args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such image")
                || stderr.contains("Unable to find image")
                || stderr.contains("pull access denied")
            {
                return Err(SandboxError::ImageNotFound(spec.profile.image));
            }
            return Err(SandboxError::StartFailed(stderr));
        }

        info!(container = %name, image = %spec.profile.image, "Container created");

        Ok(Box::new(DockerSandbox {
            docker_bin: self.config.docker_bin.clone(),
            name,
            time_limit: spec.limits.time_limit(),
            max_log_lines: self.config.max_log_lines,
            source_dir: Some(source_dir),
            child: None,
            readers: Vec::new(),
            output: Arc::new(Mutex::new(Vec::new())),
            started_at: None,
            duration: None,
            timed_out: false,
            disposed: false,
        }))
    }
}

/// Shared sink of captured output lines.
type OutputSink = Arc<Mutex<Vec<(OutputStream, String)>>>;

struct DockerSandbox {
    docker_bin: String,
    name: String,
    time_limit: Duration,
    max_log_lines: usize,
    source_dir: Option<TempDir>,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    output: OutputSink,
    started_at: Option<Instant>,
    duration: Option<Duration>,
    timed_out: bool,
    disposed: bool,
}

/// Copy lines from `reader` into `sink` until EOF.
async fn pump<R>(reader: R, stream: OutputStream, sink: OutputSink, max_lines: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if let Ok(mut lines) = sink.lock()
                    && lines.len() < max_lines
                {
                    lines.push((stream, line));
                }
            }
            Err(e) => {
                debug!(error = %e, "Output stream closed");
                break;
            }
        }
    }
}

impl DockerSandbox {
    /// Kill the container. Errors are ignored: the container may already be gone.
    async fn kill(&self) {
        let _ = Command::new(&self.docker_bin)
            .args(["kill", self.name.as_str()])
            .output()
            .await;
    }

    async fn inspect(&self) -> Result<(Option<i32>, bool)> {
        let output = Command::new(&self.docker_bin)
            .args([
                "inspect",
                "--format",
                "{{.State.ExitCode}} {{.State.OOMKilled}}",
                self.name.as_str(),
            ])
            .output()
            .await?;

        if !output.status.success() {
            return Err(SandboxError::Command {
                command: "docker inspect".to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut fields = stdout.split_whitespace();
        let exit_code = fields.next().and_then(|s| s.parse::<i32>().ok());
        let oom_killed = fields.next() == Some("true");
        Ok((exit_code, oom_killed))
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, stdin: &[u8]) -> Result<()> {
        if self.child.is_some() {
            return Err(SandboxError::AlreadyStarted);
        }

        let mut child = Command::new(&self.docker_bin)
            .args(["start", "--attach", "--interactive", self.name.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;
        self.started_at = Some(Instant::now());

        if let Some(stdout) = child.stdout.take() {
            self.readers.push(tokio::spawn(pump(
                stdout,
                OutputStream::Stdout,
                self.output.clone(),
                self.max_log_lines,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(tokio::spawn(pump(
                stderr,
                OutputStream::Stderr,
                self.output.clone(),
                self.max_log_lines,
            )));
        }

        // Dropping the handle after the write closes the program's stdin.
        if let Some(mut handle) = child.stdin.take() {
            let input = stdin.to_vec();
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.write_all(&input).await {
                    debug!(container = %name, error = %e, "Program did not consume stdin");
                }
            });
        }

        debug!(container = %self.name, "Container started");
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let started_at = self.started_at.ok_or(SandboxError::NotStarted)?;
        let time_limit = self.time_limit;
        let child = self.child.as_mut().ok_or(SandboxError::NotStarted)?;

        let finished = tokio::time::timeout(time_limit, child.wait()).await;
        match finished {
            Ok(status) => {
                let status = status?;
                debug!(container = %self.name, status = %status, "Container exited");
            }
            Err(_) => {
                warn!(
                    container = %self.name,
                    limit_ms = time_limit.as_millis() as u64,
                    "Time limit exceeded, killing container"
                );
                self.timed_out = true;
                self.kill().await;
                if let Some(child) = self.child.as_mut() {
                    child.wait().await?;
                }
            }
        }
        self.duration = Some(started_at.elapsed());

        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        Ok(())
    }

    async fn logs(&mut self, stdout: bool, stderr: bool) -> Result<Vec<String>> {
        let lines = self
            .output
            .lock()
            .map_err(|_| SandboxError::Other("output buffer poisoned".to_string()))?;
        Ok(lines
            .iter()
            .filter(|(stream, _)| match stream {
                OutputStream::Stdout => stdout,
                OutputStream::Stderr => stderr,
            })
            .map(|(_, line)| line.clone())
            .collect())
    }

    async fn state(&mut self) -> Result<SandboxState> {
        let duration = self.duration.ok_or(SandboxError::NotStarted)?;
        let (exit_code, oom_killed) = self.inspect().await?;
        Ok(SandboxState {
            exit_code: if self.timed_out { None } else { exit_code },
            duration,
            time_limit_exceeded: self.timed_out,
            memory_limit_exceeded: oom_killed,
        })
    }

    async fn dispose(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.disposed = true;
        for reader in this.readers.drain(..) {
            reader.abort();
        }

        let output = Command::new(&this.docker_bin)
            .args(["rm", "--force", this.name.as_str()])
            .output()
            .await?;

        if let Some(dir) = this.source_dir.take()
            && let Err(e) = dir.close()
        {
            warn!(container = %this.name, error = %e, "Failed to remove source directory");
        }

        if !output.status.success() {
            return Err(SandboxError::Command {
                command: "docker rm".to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(container = %this.name, "Container removed");
        Ok(())
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        // Best effort: a sandbox dropped without dispose still removes its container.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let docker_bin = self.docker_bin.clone();
            let name = self.name.clone();
            handle.spawn(async move {
                let _ = Command::new(&docker_bin)
                    .args(["rm", "--force", name.as_str()])
                    .output()
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> SandboxSpec {
        SandboxSpec {
            profile: DockerProfile {
                image: "python:3.11-slim".to_string(),
                command: vec!["python".to_string(), "main.py".to_string()],
                workdir: PathBuf::from("/sandbox"),
                user: Some("sandbox".to_string()),
            },
            limits: Limits {
                time_secs: 2.0,
                memory_mb: 64,
                cpu_count: 0.5,
                pids_limit: 16,
            },
            files: vec![SandboxFile::new("main.py", "print(1)")],
        }
    }

    #[test]
    fn test_create_args_apply_limits_and_isolation() {
        let executor = DockerSandboxExecutor::new(DockerSandboxConfig::default());
        let args = executor.create_args("coderun-1", "/tmp/src", &test_spec());

        let joined = args.join(" ");
        assert!(joined.starts_with("create --name coderun-1 --interactive"));
        assert!(joined.contains("--memory 64m --memory-swap 64m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--pids-limit 16"));
        assert!(joined.contains("--volume /tmp/src:/sandbox:ro"));
        assert!(joined.contains("--workdir /sandbox"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--user sandbox"));
        assert!(joined.ends_with("python:3.11-slim python main.py"));
    }

    #[test]
    fn test_create_args_without_network_isolation_or_user() {
        let executor = DockerSandboxExecutor::new(DockerSandboxConfig {
            network_disabled: false,
            ..Default::default()
        });
        let mut spec = test_spec();
        spec.profile.user = None;

        let args = executor.create_args("coderun-2", "/tmp/src", &spec);
        assert!(!args.iter().any(|a| a == "--network"));
        assert!(!args.iter().any(|a| a == "--user"));
    }

    #[tokio::test]
    async fn test_pump_splits_lines_and_caps_output() {
        let sink: OutputSink = Arc::new(Mutex::new(Vec::new()));
        let input: &[u8] = b"one\r\ntwo\nthree\nfour";

        pump(input, OutputStream::Stdout, sink.clone(), 3).await;

        let lines = sink.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec![
                (OutputStream::Stdout, "one".to_string()),
                (OutputStream::Stdout, "two".to_string()),
                (OutputStream::Stdout, "three".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_build_fails_with_missing_cli() {
        let executor = DockerSandboxExecutor::new(DockerSandboxConfig {
            docker_bin: "/nonexistent/docker".to_string(),
            ..Default::default()
        });

        let result = executor.build(test_spec()).await;
        assert!(matches!(result, Err(SandboxError::Io(_))));
    }
}
