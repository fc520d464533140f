// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock sandbox executor for testing.
//!
//! Simulates sandbox execution without a container engine. The program's
//! behaviour is produced by a script closure; by default stdin is echoed
//! back as stdout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::*;

/// Scripted behaviour of a mock program.
pub type MockScript = dyn Fn(&SandboxSpec, &str) -> MockOutcome + Send + Sync;

/// What a mock program "did".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockOutcome {
    /// Exit code reported by `state`.
    pub exit_code: Option<i32>,
    /// Output lines in production order.
    pub lines: Vec<(OutputStream, String)>,
    /// Reported duration; defaults to the executor delay.
    pub duration: Option<Duration>,
    /// Reported time limit flag.
    pub time_limit_exceeded: bool,
    /// Reported memory limit flag.
    pub memory_limit_exceeded: bool,
}

impl MockOutcome {
    /// A program that exited with `code` and printed nothing.
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    /// Append a stdout line.
    pub fn stdout(mut self, line: impl Into<String>) -> Self {
        self.lines.push((OutputStream::Stdout, line.into()));
        self
    }

    /// Append a stderr line.
    pub fn stderr(mut self, line: impl Into<String>) -> Self {
        self.lines.push((OutputStream::Stderr, line.into()));
        self
    }

    /// Report the time limit as exceeded.
    pub fn time_limit(mut self) -> Self {
        self.time_limit_exceeded = true;
        self
    }

    /// Report the memory limit as exceeded.
    pub fn memory_limit(mut self) -> Self {
        self.memory_limit_exceeded = true;
        self
    }

    /// Report a fixed duration.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Lifecycle stage at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockStage {
    /// `SandboxExecutor::build`
    Build,
    /// `Sandbox::run`
    Run,
    /// `Sandbox::wait`
    Wait,
    /// `Sandbox::logs`
    Logs,
    /// `Sandbox::state`
    State,
    /// `Sandbox::dispose`
    Dispose,
}

#[derive(Debug, Default)]
struct MockCounters {
    built: AtomicUsize,
    disposed: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

/// Mock sandbox executor for testing.
pub struct MockSandboxExecutor {
    script: Arc<MockScript>,
    /// Simulated execution time spent in `wait`.
    pub execution_delay: Duration,
    /// Stage that returns an error instead of succeeding.
    pub fail_at: Option<MockStage>,
    counters: Arc<MockCounters>,
    specs: Arc<Mutex<Vec<SandboxSpec>>>,
}

impl Default for MockSandboxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSandboxExecutor {
    /// Create an executor whose programs echo stdin and exit with 0.
    pub fn new() -> Self {
        Self::with_script(|_, stdin| {
            stdin
                .lines()
                .fold(MockOutcome::exited(0), |outcome, line| outcome.stdout(line))
        })
    }

    /// Create an executor driven by `script`.
    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&SandboxSpec, &str) -> MockOutcome + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            execution_delay: Duration::ZERO,
            fail_at: None,
            counters: Arc::new(MockCounters::default()),
            specs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create an executor whose programs always report `outcome`.
    pub fn returning(outcome: MockOutcome) -> Self {
        Self::with_script(move |_, _| outcome.clone())
    }

    /// Fail at the given stage.
    pub fn failing_at(mut self, stage: MockStage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Spend `delay` in every `wait`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    /// Number of sandboxes built successfully.
    pub fn built_count(&self) -> usize {
        self.counters.built.load(Ordering::SeqCst)
    }

    /// Number of sandboxes disposed (including failed disposals).
    pub fn disposed_count(&self) -> usize {
        self.counters.disposed.load(Ordering::SeqCst)
    }

    /// Sandboxes built but not yet disposed.
    pub fn active_count(&self) -> usize {
        self.built_count().saturating_sub(self.disposed_count())
    }

    /// Highest number of sandboxes that were inside `wait` at the same time.
    pub fn peak_running(&self) -> usize {
        self.counters.peak_running.load(Ordering::SeqCst)
    }

    /// Specs passed to `build`, in call order.
    pub fn recorded_specs(&self) -> Vec<SandboxSpec> {
        self.specs.lock().map(|specs| specs.clone()).unwrap_or_default()
    }
}

fn injected(fail_at: Option<MockStage>, stage: MockStage) -> Result<()> {
    if fail_at == Some(stage) {
        let message = format!("injected {stage:?} failure");
        return Err(match stage {
            MockStage::Build | MockStage::Run => SandboxError::StartFailed(message),
            _ => SandboxError::Other(message),
        });
    }
    Ok(())
}

#[async_trait]
impl SandboxExecutor for MockSandboxExecutor {
    fn executor_type(&self) -> &'static str {
        "mock"
    }

    async fn build(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>> {
        if let Ok(mut specs) = self.specs.lock() {
            specs.push(spec.clone());
        }
        injected(self.fail_at, MockStage::Build)?;
        for file in &spec.files {
            file.validate()?;
        }

        let id = self.counters.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSandbox {
            name: format!("mock-{id}"),
            spec,
            script: self.script.clone(),
            delay: self.execution_delay,
            fail_at: self.fail_at,
            counters: self.counters.clone(),
            outcome: None,
        }))
    }
}

struct MockSandbox {
    name: String,
    spec: SandboxSpec,
    script: Arc<MockScript>,
    delay: Duration,
    fail_at: Option<MockStage>,
    counters: Arc<MockCounters>,
    outcome: Option<MockOutcome>,
}

impl MockSandbox {
    fn outcome(&self) -> Result<&MockOutcome> {
        self.outcome.as_ref().ok_or(SandboxError::NotStarted)
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, stdin: &[u8]) -> Result<()> {
        injected(self.fail_at, MockStage::Run)?;
        if self.outcome.is_some() {
            return Err(SandboxError::AlreadyStarted);
        }
        let stdin = String::from_utf8_lossy(stdin);
        self.outcome = Some((self.script)(&self.spec, &stdin));
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        self.outcome()?;

        let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .peak_running
            .fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.counters.running.fetch_sub(1, Ordering::SeqCst);

        injected(self.fail_at, MockStage::Wait)
    }

    async fn logs(&mut self, stdout: bool, stderr: bool) -> Result<Vec<String>> {
        injected(self.fail_at, MockStage::Logs)?;
        Ok(self
            .outcome()?
            .lines
            .iter()
            .filter(|(stream, _)| match stream {
                OutputStream::Stdout => stdout,
                OutputStream::Stderr => stderr,
            })
            .map(|(_, line)| line.clone())
            .collect())
    }

    async fn state(&mut self) -> Result<SandboxState> {
        injected(self.fail_at, MockStage::State)?;
        let outcome = self.outcome()?;
        Ok(SandboxState {
            exit_code: outcome.exit_code,
            duration: outcome.duration.unwrap_or(self.delay),
            time_limit_exceeded: outcome.time_limit_exceeded,
            memory_limit_exceeded: outcome.memory_limit_exceeded,
        })
    }

    async fn dispose(self: Box<Self>) -> Result<()> {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        injected(self.fail_at, MockStage::Dispose)
    }
}
