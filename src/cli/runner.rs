//! External command execution
//!
//! The lowest layer of the driver: run one external command, capture its
//! exit code and output, and hand the result back untouched. A nonzero exit
//! code is not an error at this layer; interpreting it is the caller's job.

use crate::error::Result;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Command Result
// =============================================================================

/// Captured outcome of one external command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Process exit code; -1 when the process died without one
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

// =============================================================================
// Command Runner Port
// =============================================================================

/// Port for external command execution
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` with `args`, returning exit code and captured output.
    ///
    /// Only failing to spawn the process is an error; command failures are
    /// reported through [`CommandResult::exit`].
    async fn run(&self, command: &str, args: &[String]) -> Result<CommandResult>;
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;

// =============================================================================
// System Runner
// =============================================================================

/// Runs commands against the operating system
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &str, args: &[String]) -> Result<CommandResult> {
        // The vendor CLI output formats are locale sensitive.
        let output = Command::new(command)
            .args(args)
            .env("LANG", "C")
            .stdin(Stdio::null())
            .output()
            .await?;

        let result = CommandResult {
            exit: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.exit != 0 {
            debug!(
                "cmd: {} {}, ret: {}, stdout: {}, stderr: {}",
                command,
                args.join(" "),
                result.exit,
                result.stdout.split_whitespace().collect::<Vec<_>>().join(" "),
                result.stderr.split_whitespace().collect::<Vec<_>>().join(" "),
            );
        }

        Ok(result)
    }
}

// =============================================================================
// Scripted Runner (test support)
// =============================================================================

/// Scripted command runner for tests: canned results keyed by the longest
/// matching prefix of the command line, with per-key response sequences.
#[cfg(test)]
pub(crate) struct ScriptedRunner {
    responses: parking_lot::Mutex<Vec<(String, std::collections::VecDeque<CommandResult>)>>,
    calls: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: parking_lot::Mutex::new(Vec::new()),
            calls: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Register a single result; the last result for a key repeats forever.
    pub fn on(&self, prefix: &str, result: CommandResult) {
        self.on_seq(prefix, vec![result]);
    }

    /// Register a sequence of results returned in order.
    pub fn on_seq(&self, prefix: &str, results: Vec<CommandResult>) {
        self.responses
            .lock()
            .push((prefix.to_string(), results.into_iter().collect()));
    }

    /// Every command line observed, joined by single spaces.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str, args: &[String]) -> Result<CommandResult> {
        let line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().push(line.clone());

        let mut responses = self.responses.lock();
        let best = responses
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        Ok(match best {
            Some((_, queue)) => {
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_default()
                }
            }
            None => CommandResult::default(),
        })
    }
}
