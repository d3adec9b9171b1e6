//! Resilient command invocation
//!
//! Wraps the command runner in a bounded-wall-clock retry protocol for the
//! control process. Exit codes are classified into success, transient
//! array-busy, expired authentication, control-process-down and fatal
//! bands; the first two are retried, the middle two trigger one recovery
//! action (re-login or process start) before the next attempt, and fatal
//! codes stop the loop immediately. A "resource locked by another
//! controller" stderr signature suspends classification entirely until the
//! lock holder releases it or the hold-off bound expires.

use crate::cli::runner::{CommandResult, CommandRunnerRef};
use crate::config::{DriverConfig, INSTANCE_MAIN, INSTANCE_PAIR};
use crate::error::{Error, Result};
use crate::lock::{LockNames, LockRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, warn};

// =============================================================================
// Exit Codes
// =============================================================================

pub const EX_ENAUTH: i32 = 202;
pub const EX_ENOOBJ: i32 = 205;
pub const EX_CMDRJE: i32 = 221;
pub const EX_ENLDEV: i32 = 227;
pub const EX_CMDIOE: i32 = 237;
pub const EX_ENOGRP: i32 = 239;
pub const EX_INVCMD: i32 = 240;
pub const EX_INVMOD: i32 = 241;
pub const EX_ENORMT: i32 = 242;
pub const EX_ENODEV: i32 = 246;
pub const EX_ENOENT: i32 = 247;
pub const EX_OPTINV: i32 = 248;
pub const EX_ATTDBG: i32 = 250;
pub const EX_ATTHOR: i32 = 251;
pub const EX_INVARG: i32 = 253;
pub const EX_COMERR: i32 = 255;

/// Codes meaning the control process itself is unreachable
const CONTROL_PROCESS_DOWN: [i32; 4] = [EX_ENORMT, EX_ATTDBG, EX_ATTHOR, EX_COMERR];

/// Transient command-IO-to-array codes worth retrying as-is
const COMMAND_IO_TO_RAID: [i32; 5] = [EX_CMDRJE, EX_CMDIOE, EX_INVCMD, EX_INVMOD, EX_OPTINV];

/// Codes meaning the addressed object does not exist
pub const NO_SUCH_DEVICE: [i32; 3] = [EX_ENOGRP, EX_ENODEV, EX_ENOENT];

/// Codes returned for an id query outside the array's defined range
pub const INVALID_RANGE: [i32; 2] = [EX_ENLDEV, EX_INVARG];

// =============================================================================
// Stderr Signatures
// =============================================================================

/// A logical unit path already exists for the device
pub const LU_PATH_DEFINED: &str = "SSB=0xB958,0x015A";
/// The requested LUN already carries another device
pub const ANOTHER_LDEV_MAPPED: &str = "SSB=0xB958,0x0947";
/// The resource group is locked by another controller
const RESOURCE_LOCKED: &str = "SSB=0x2E11,0x2205";

/// Error signatures that must never be retried
const NO_RETRY_SIGNATURES: [&str; 11] = [
    "SSB=0x2E10,0x9705",
    "SSB=0x2E10,0x9706",
    "SSB=0x2E10,0x9707",
    "SSB=0x2E11,0x8303",
    "SSB=0x2E30,0x0007",
    "SSB=0xB956,0x3173",
    "SSB=0xB956,0x31D7",
    "SSB=0xB956,0x31D9",
    "SSB=0xB957,0x4188",
    LU_PATH_DEFINED,
    "SSB=0xB958,0x015E",
];

// =============================================================================
// Timing
// =============================================================================

/// Default wall-clock bound for one invocation
pub const EXEC_MAX_WAIT: Duration = Duration::from_secs(30);
/// Default interval between retries
pub const EXEC_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// How long a foreign resource-group lock is waited out
const LOCK_WAIT: Duration = Duration::from_secs(2 * 60 * 60);
/// Default bound for long-running array-side state changes
pub const DEFAULT_PROCESS_WAIT: Duration = Duration::from_secs(15 * 60);

// =============================================================================
// Options
// =============================================================================

/// Exit codes treated as success for one invocation
#[derive(Debug, Clone, Copy)]
pub enum SuccessCodes {
    /// The control process's normal code band (0..=127)
    Horcm,
    /// The normal band plus specific extra codes
    HorcmPlus(&'static [i32]),
    /// Every exit code
    All,
}

impl SuccessCodes {
    pub fn contains(&self, code: i32) -> bool {
        match self {
            SuccessCodes::Horcm => (0..=127).contains(&code),
            SuccessCodes::HorcmPlus(extra) => {
                (0..=127).contains(&code) || extra.contains(&code)
            }
            SuccessCodes::All => true,
        }
    }
}

/// Per-invocation execution options
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub success: SuccessCodes,
    /// Stderr signatures treated as an idempotent no-op (success)
    pub ignore_stderr: Vec<&'static str>,
    pub timeout: Duration,
    pub interval: Duration,
    /// Return `Err` when the final result is not a success
    pub raise_on_failure: bool,
    /// This invocation is itself the login command
    pub is_login: bool,
    /// Control-process instance the command is issued against
    pub unit: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            success: SuccessCodes::Horcm,
            ignore_stderr: Vec::new(),
            timeout: EXEC_MAX_WAIT,
            interval: EXEC_RETRY_INTERVAL,
            raise_on_failure: true,
            is_login: false,
            unit: INSTANCE_MAIN,
        }
    }
}

impl ExecOptions {
    pub fn success(mut self, codes: SuccessCodes) -> Self {
        self.success = codes;
        self
    }

    pub fn ignore(mut self, signature: &'static str) -> Self {
        self.ignore_stderr.push(signature);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn no_raise(mut self) -> Self {
        self.raise_on_failure = false;
        self
    }

    pub fn pair_unit(mut self) -> Self {
        self.unit = INSTANCE_PAIR;
        self
    }
}

fn matches_any(stderr: &str, signatures: &[&str]) -> bool {
    !stderr.is_empty() && signatures.iter().any(|s| stderr.contains(s))
}

/// Re-login bookkeeping for one invocation's failure streak
#[derive(Clone, Copy)]
enum AuthStreak {
    Fresh,
    Seen,
    Refreshed,
}

// =============================================================================
// Shell
// =============================================================================

/// Command shell bound to one array's control-process instances
///
/// All array commands flow through here. `run_raidcom` / `run_pair_cmd`
/// append the array address and instance selector, drive the retry
/// protocol, and verify the final result against the caller's success set.
pub struct HorcmShell {
    runner: CommandRunnerRef,
    pub(crate) config: Arc<DriverConfig>,
    pub(crate) locks: Arc<LockRegistry>,
    pub(crate) lock_names: LockNames,
}

impl HorcmShell {
    pub fn new(
        runner: CommandRunnerRef,
        config: Arc<DriverConfig>,
        locks: Arc<LockRegistry>,
    ) -> Arc<Self> {
        let lock_names = LockNames::new(&config);
        Arc::new(Self {
            runner,
            config,
            locks,
            lock_names,
        })
    }

    /// Run a `raidcom` subcommand against the main instance
    pub async fn run_raidcom(&self, args: &[&str], opts: ExecOptions) -> Result<CommandResult> {
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        full.push("-s".to_string());
        full.push(self.config.serial.clone());
        full.push(format!("-I{}", self.config.instances[INSTANCE_MAIN]));
        let result = self.run_storage_cli("raidcom", &full, &opts).await?;
        self.verify("raidcom", &full, result, &opts)
    }

    /// Run a pair command (`paircreate`, `pairsplit`, ...) against the
    /// pair-operation instance
    pub async fn run_pair_cmd(
        &self,
        command: &str,
        args: &[&str],
        opts: ExecOptions,
    ) -> Result<CommandResult> {
        let opts = opts.pair_unit();
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        full.push(format!("-IM{}", self.config.instances[INSTANCE_PAIR]));
        let result = self.run_storage_cli(command, &full, &opts).await?;
        self.verify(command, &full, result, &opts)
    }

    /// Run a `raidcom` subcommand addressed through the main instance's
    /// manager selector (used when registering copy-group configuration)
    pub async fn run_raidcom_im(&self, args: &[&str], opts: ExecOptions) -> Result<CommandResult> {
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        full.push("-s".to_string());
        full.push(self.config.serial.clone());
        full.push(format!("-IM{}", self.config.instances[INSTANCE_MAIN]));
        let result = self.run_storage_cli("raidcom", &full, &opts).await?;
        self.verify("raidcom", &full, result, &opts)
    }

    /// Run a raw command once, without the retry protocol
    pub(crate) async fn run_raw(&self, command: &str, args: &[&str]) -> Result<CommandResult> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(command, &args).await
    }

    /// The retry protocol (spec steps: lock hold-off, terminal check,
    /// recovery, transient retry)
    async fn run_storage_cli(
        &self,
        command: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<CommandResult> {
        let start = Instant::now();
        let mut auth = AuthStreak::Fresh;

        loop {
            let result = self.runner.run(command, args).await?;

            // A foreign controller holds the resource group: neither success
            // nor failure. Hold off until it releases or the bound expires.
            if matches_any(&result.stderr, &[RESOURCE_LOCKED]) && start.elapsed() < LOCK_WAIT {
                debug!(
                    "resource group locked by another controller, holding off (cmd: {})",
                    command
                );
                sleep(opts.interval).await;
                continue;
            }

            let no_retry = matches_any(&result.stderr, &NO_RETRY_SIGNATURES)
                || matches_any(&result.stderr, &opts.ignore_stderr);
            if opts.success.contains(result.exit)
                || start.elapsed() >= opts.timeout
                || no_retry
            {
                return Ok(result);
            }

            if result.exit == EX_ENAUTH {
                match auth {
                    AuthStreak::Fresh => auth = AuthStreak::Seen,
                    AuthStreak::Seen => {
                        if opts.is_login || !self.relogin().await {
                            warn!("failed to refresh control-process authentication");
                            return Ok(result);
                        }
                        auth = AuthStreak::Refreshed;
                    }
                    // One re-login per failure streak; a third strike is final.
                    AuthStreak::Refreshed => return Ok(result),
                }
            } else if CONTROL_PROCESS_DOWN.contains(&result.exit) {
                auth = AuthStreak::Fresh;
                if !self.start_instance(opts.unit).await {
                    return Ok(result);
                }
            } else if COMMAND_IO_TO_RAID.contains(&result.exit) {
                auth = AuthStreak::Fresh;
            } else {
                return Ok(result);
            }

            sleep(opts.interval).await;
        }
    }

    /// Boxed: the login command flows back through the retry loop, so the
    /// recursive edge needs indirection.
    fn relogin(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self.login().await {
                Ok(()) => true,
                Err(_) => {
                    warn!(user = %self.config.user, "control-process re-login failed");
                    false
                }
            }
        })
    }

    /// Check the final result against the success set and ignore list
    fn verify(
        &self,
        command: &str,
        args: &[String],
        result: CommandResult,
        opts: &ExecOptions,
    ) -> Result<CommandResult> {
        if opts.success.contains(result.exit) || matches_any(&result.stderr, &opts.ignore_stderr)
        {
            return Ok(result);
        }
        let cmd = format!("{} {}", command, args.join(" "));
        error!(
            "command failed (cmd: {}, ret: {}, stdout: {}, stderr: {})",
            cmd,
            result.exit,
            result.stdout.split_whitespace().collect::<Vec<_>>().join(" "),
            result.stderr.split_whitespace().collect::<Vec<_>>().join(" "),
        );
        if opts.raise_on_failure {
            return Err(Error::CommandFailed {
                cmd,
                exit: result.exit,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::runner::ScriptedRunner;
    use assert_matches::assert_matches;

    fn shell(runner: Arc<ScriptedRunner>) -> Arc<HorcmShell> {
        let config = Arc::new(DriverConfig {
            serial: "492015".into(),
            pool: "30".into(),
            target_ports: vec!["CL1-A".into()],
            pair_target_ports: vec!["CL1-A".into()],
            user: "user".into(),
            password: "secret".into(),
            ..DriverConfig::default()
        });
        HorcmShell::new(runner, config, LockRegistry::new())
    }

    fn fast() -> ExecOptions {
        ExecOptions::default()
            .timeout(Duration::from_millis(200))
            .interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom get ldev", CommandResult::ok("LDEV : 1\n"));
        let shell = shell(runner);

        let result = shell
            .run_raidcom(&["get", "ldev", "-ldev_id", "1"], fast())
            .await
            .unwrap();
        assert_eq!(result.exit, 0);
        assert_eq!(result.stdout, "LDEV : 1\n");
    }

    #[tokio::test]
    async fn test_appends_array_address_and_instance() {
        let runner = ScriptedRunner::new();
        let shell = shell(runner.clone());
        shell.run_raidcom(&["get", "port"], fast()).await.unwrap();
        assert_eq!(runner.calls(), vec!["raidcom get port -s 492015 -I200"]);

        shell
            .run_pair_cmd("pairdisplay", &["-CLI", "-d", "492015", "7", "0"], fast())
            .await
            .unwrap();
        assert!(runner
            .calls()
            .contains(&"pairdisplay -CLI -d 492015 7 0 -IM201".to_string()));
    }

    #[tokio::test]
    async fn test_transient_busy_retries_until_timeout() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom add ldev", CommandResult::failed(EX_CMDIOE, ""));
        let shell = shell(runner.clone());

        let timeout = Duration::from_millis(200);
        let interval = Duration::from_millis(40);
        let opts = ExecOptions::default()
            .timeout(timeout)
            .interval(interval)
            .no_raise();

        let started = Instant::now();
        let result = shell.run_raidcom(&["add", "ldev"], opts).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.exit, EX_CMDIOE);
        // Bounded by wall clock: no earlier than T, no later than T + I
        // (plus scheduling slack).
        assert!(elapsed >= timeout, "returned early: {:?}", elapsed);
        assert!(elapsed < timeout + interval + Duration::from_millis(80));
        assert!(runner.calls_matching("raidcom add ldev") > 1);
    }

    #[tokio::test]
    async fn test_raises_on_terminal_failure() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom delete ldev", CommandResult::failed(EX_ENODEV, ""));
        let shell = shell(runner);

        let err = shell
            .run_raidcom(&["delete", "ldev", "-ldev_id", "5"], fast())
            .await
            .unwrap_err();
        assert_matches!(err, Error::CommandFailed { exit: EX_ENODEV, .. });
    }

    #[tokio::test]
    async fn test_no_retry_signature_stops_immediately() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom add ldev",
            CommandResult::failed(EX_CMDRJE, "SSB=0x2E10,0x9705"),
        );
        let shell = shell(runner.clone());

        let result = shell
            .run_raidcom(&["add", "ldev"], fast().no_raise())
            .await
            .unwrap();
        assert_eq!(result.exit, EX_CMDRJE);
        assert_eq!(runner.calls_matching("raidcom add ldev"), 1);
    }

    #[tokio::test]
    async fn test_ignored_signature_is_success() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom add lun",
            CommandResult::failed(EX_CMDRJE, ANOTHER_LDEV_MAPPED),
        );
        let shell = shell(runner);

        // Raising is enabled, but the signature is on the ignore list.
        let result = shell
            .run_raidcom(&["add", "lun"], fast().ignore(ANOTHER_LDEV_MAPPED))
            .await
            .unwrap();
        assert_eq!(result.exit, EX_CMDRJE);
    }

    #[tokio::test]
    async fn test_expired_authentication_triggers_one_relogin() {
        let runner = ScriptedRunner::new();
        runner.on_seq(
            "raidcom get ldev",
            vec![
                CommandResult::failed(EX_ENAUTH, ""),
                CommandResult::failed(EX_ENAUTH, ""),
                CommandResult::ok("LDEV : 1\n"),
            ],
        );
        runner.on("raidcom -login", CommandResult::ok(""));
        let shell = shell(runner.clone());

        let result = shell
            .run_raidcom(&["get", "ldev", "-ldev_id", "1"], fast())
            .await
            .unwrap();
        assert_eq!(result.exit, 0);
        assert_eq!(runner.calls_matching("raidcom -login"), 1);
    }

    #[tokio::test]
    async fn test_failed_relogin_stops_the_loop() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom get ldev", CommandResult::failed(EX_ENAUTH, ""));
        runner.on("raidcom -login", CommandResult::failed(EX_INVARG, ""));
        let shell = shell(runner.clone());

        let result = shell
            .run_raidcom(&["get", "ldev", "-ldev_id", "1"], fast().no_raise())
            .await
            .unwrap();
        assert_eq!(result.exit, EX_ENAUTH);
    }

    #[tokio::test]
    async fn test_control_process_down_triggers_restart() {
        let runner = ScriptedRunner::new();
        runner.on_seq(
            "raidcom get ldev",
            vec![
                CommandResult::failed(EX_ATTHOR, ""),
                CommandResult::ok("LDEV : 1\n"),
            ],
        );
        // The instance reports stopped, then starts cleanly.
        runner.on("env HORCMINST=200 horcmgr -check", CommandResult::failed(3, ""));
        runner.on("horcmstart.sh 200", CommandResult::ok(""));
        let shell = shell(runner.clone());

        let result = shell
            .run_raidcom(&["get", "ldev", "-ldev_id", "1"], fast())
            .await
            .unwrap();
        assert_eq!(result.exit, 0);
        assert_eq!(runner.calls_matching("horcmstart.sh 200"), 1);
    }

    #[test]
    fn test_success_code_bands() {
        assert!(SuccessCodes::Horcm.contains(0));
        assert!(SuccessCodes::Horcm.contains(127));
        assert!(!SuccessCodes::Horcm.contains(EX_ENOOBJ));
        assert!(SuccessCodes::HorcmPlus(&NO_SUCH_DEVICE).contains(EX_ENOENT));
        assert!(!SuccessCodes::HorcmPlus(&NO_SUCH_DEVICE).contains(EX_COMERR));
        assert!(SuccessCodes::All.contains(EX_COMERR));
    }
}
