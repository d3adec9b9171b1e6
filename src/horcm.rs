//! Control-process session management
//!
//! The HORCM-style control process mediates every array command. This
//! module owns its lifecycle: the per-instance configuration file (created
//! or patched during setup only), start/shutdown/restart with bounded
//! waits, authentication, and the CLI version probe. Restarts are
//! serialized per instance through the lock registry; two callers
//! restarting one instance concurrently would race on its configuration.

use crate::cli::invoker::{ExecOptions, HorcmShell};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exit code of `horcmgr -check` when the instance is up
const HORCM_RUNNING: i32 = 1;

/// UDP port base for instance configuration files
const PORT_BASE: u32 = 31000;

/// Interval between shutdown re-checks
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on waiting for an instance to stop
const SHUTDOWN_WAIT: Duration = Duration::from_secs(15 * 60);

/// Matches the section head after which the command device line belongs
static CMD_SECTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"((?:^|\n)HORCM_CMD\n)").unwrap());

/// Matches the CLI version banner of `raidqry -h`
static CLI_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Ver&Rev: +(\S+)").unwrap());

impl HorcmShell {
    async fn instance_running(&self, instance: u16) -> Result<bool> {
        let instance_env = format!("HORCMINST={}", instance);
        let result = self
            .run_raw("env", &[instance_env.as_str(), "horcmgr", "-check"])
            .await?;
        Ok(result.exit == HORCM_RUNNING)
    }

    /// Start the instance if it is not running; `true` when it is up
    pub async fn start_instance(&self, unit: usize) -> bool {
        let instance = self.config.instances[unit];
        let _guard = self.locks.acquire(&self.lock_names.instance[unit]).await;

        let running = match self.instance_running(instance).await {
            Ok(running) => running,
            Err(_) => false,
        };
        if running {
            return true;
        }
        let instance_arg = instance.to_string();
        match self.run_raw("horcmstart.sh", &[instance_arg.as_str()]).await {
            Ok(result) if result.exit == 0 || result.exit == HORCM_RUNNING => true,
            _ => {
                warn!(instance, "failed to start the control process");
                false
            }
        }
    }

    /// Stop and start the instance, waiting out a slow shutdown
    pub async fn restart_instance(&self, unit: usize) -> Result<()> {
        let instance = self.config.instances[unit];
        let _guard = self.locks.acquire(&self.lock_names.instance[unit]).await;

        let deadline = Instant::now() + SHUTDOWN_WAIT;
        loop {
            if !self.instance_running(instance).await? {
                break;
            }
            let instance_arg = instance.to_string();
            let shutdown = self
                .run_raw("horcmshutdown.sh", &[instance_arg.as_str()])
                .await?;
            if (shutdown.exit != 0 && self.instance_running(instance).await?)
                || Instant::now() >= deadline
            {
                return Err(Error::ControlProcessShutdown { instance });
            }
            sleep(SHUTDOWN_CHECK_INTERVAL).await;
        }

        let instance_arg = instance.to_string();
        let result = self
            .run_raw("horcmstart.sh", &[instance_arg.as_str()])
            .await?;
        if result.exit != 0 && result.exit != HORCM_RUNNING {
            return Err(Error::ControlProcessRestart { instance });
        }
        debug!(instance, "control process restarted");
        Ok(())
    }

    /// Authenticate against the array through the control process
    pub async fn login(&self) -> Result<()> {
        let user = self.config.user.clone();
        let password = self.config.password.clone();
        let opts = ExecOptions {
            is_login: true,
            ..ExecOptions::default()
        };
        self.run_raidcom(&["-login", &user, &password], opts)
            .await?;
        Ok(())
    }

    /// Create or patch the instance configuration file under `conf_dir`
    ///
    /// The file is only touched during setup. An existing file keeps its
    /// content except for the command device line, which is inserted into
    /// the `HORCM_CMD` section when missing.
    pub fn write_instance_conf(&self, unit: usize, conf_dir: &Path) -> Result<()> {
        let instance = self.config.instances[unit];
        let serial = &self.config.serial;
        let path = conf_dir.join(format!("horcm{}.conf", instance));
        let device_line = format!(r"\\.\CMD-{}:/dev/sd", serial);

        let content = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.lines().any(|line| line == device_line) {
                return Ok(());
            }
            content
        } else {
            format!(
                "\nHORCM_MON\n\
                 #ip_address        service         poll(10ms)     timeout(10ms)\n\
                 127.0.0.1 {:>16}               6000              3000\n\
                 HORCM_CMD\n",
                PORT_BASE + u32::from(instance)
            )
        };

        let patched = CMD_SECTION
            .replace(&content, format!("${{1}}{}\n", device_line).as_str())
            .into_owned();
        std::fs::write(&path, patched).map_err(|e| {
            warn!(file = %path.display(), error = %e, "failed to write instance configuration");
            Error::ControlProcessConfig {
                file: path.display().to_string(),
                exit: e.raw_os_error().unwrap_or(-1),
            }
        })?;
        debug!(file = %path.display(), "wrote instance configuration");
        Ok(())
    }

    /// Name and version of the vendor CLI, for the setup log banner
    pub async fn cli_info(&self) -> (String, String) {
        let version = match self.run_raw("raidqry", &["-h"]).await {
            Ok(result) => CLI_VERSION
                .captures(&result.stdout)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            Err(_) => "N/A".to_string(),
        };
        ("RAID Manager".to_string(), version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::runner::{CommandResult, ScriptedRunner};
    use crate::config::{DriverConfig, INSTANCE_MAIN, INSTANCE_PAIR};
    use crate::lock::LockRegistry;
    use assert_matches::assert_matches;
    use std::sync::Arc;

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

    #[tokio::test]
    async fn test_start_instance_skips_running_process() {
        let runner = ScriptedRunner::new();
        runner.on(
            "env HORCMINST=200 horcmgr -check",
            CommandResult::failed(HORCM_RUNNING, ""),
        );
        let shell = shell(runner.clone());

        assert!(shell.start_instance(INSTANCE_MAIN).await);
        assert_eq!(runner.calls_matching("horcmstart.sh"), 0);
    }

    #[tokio::test]
    async fn test_start_instance_starts_stopped_process() {
        let runner = ScriptedRunner::new();
        runner.on(
            "env HORCMINST=200 horcmgr -check",
            CommandResult::failed(3, ""),
        );
        runner.on("horcmstart.sh 200", CommandResult::ok(""));
        let shell = shell(runner.clone());

        assert!(shell.start_instance(INSTANCE_MAIN).await);
        assert_eq!(runner.calls_matching("horcmstart.sh 200"), 1);
    }

    #[tokio::test]
    async fn test_start_instance_reports_failure() {
        let runner = ScriptedRunner::new();
        runner.on(
            "env HORCMINST=200 horcmgr -check",
            CommandResult::failed(3, ""),
        );
        runner.on("horcmstart.sh 200", CommandResult::failed(2, ""));
        let shell = shell(runner);

        assert!(!shell.start_instance(INSTANCE_MAIN).await);
    }

    #[tokio::test]
    async fn test_restart_instance_stops_then_starts() {
        let runner = ScriptedRunner::new();
        runner.on_seq(
            "env HORCMINST=201 horcmgr -check",
            vec![
                CommandResult::failed(HORCM_RUNNING, ""),
                CommandResult::failed(3, ""),
            ],
        );
        runner.on("horcmshutdown.sh 201", CommandResult::ok(""));
        runner.on("horcmstart.sh 201", CommandResult::ok(""));
        let shell = shell(runner.clone());

        shell.restart_instance(INSTANCE_PAIR).await.unwrap();
        assert_eq!(runner.calls_matching("horcmshutdown.sh 201"), 1);
        assert_eq!(runner.calls_matching("horcmstart.sh 201"), 1);
    }

    #[tokio::test]
    async fn test_restart_instance_shutdown_failure() {
        let runner = ScriptedRunner::new();
        runner.on(
            "env HORCMINST=201 horcmgr -check",
            CommandResult::failed(HORCM_RUNNING, ""),
        );
        runner.on("horcmshutdown.sh 201", CommandResult::failed(2, ""));
        let shell = shell(runner);

        assert_matches!(
            shell.restart_instance(INSTANCE_PAIR).await,
            Err(Error::ControlProcessShutdown { instance: 201 })
        );
    }

    #[tokio::test]
    async fn test_login_issues_the_login_command() {
        let runner = ScriptedRunner::new();
        let shell = shell(runner.clone());
        shell.login().await.unwrap();
        assert_eq!(
            runner.calls(),
            vec!["raidcom -login user secret -s 492015 -I200"]
        );
    }

    #[test]
    fn test_write_instance_conf_creates_file() {
        let runner = ScriptedRunner::new();
        let shell = shell(runner);
        let dir = tempfile::tempdir().unwrap();

        shell.write_instance_conf(INSTANCE_MAIN, dir.path()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("horcm200.conf")).unwrap();
        assert!(content.contains("HORCM_MON"));
        assert!(content.contains("31200"));
        assert!(content.contains("HORCM_CMD\n\\\\.\\CMD-492015:/dev/sd\n"));
    }

    #[test]
    fn test_write_instance_conf_patches_existing_file() {
        let runner = ScriptedRunner::new();
        let shell = shell(runner);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("horcm200.conf");
        std::fs::write(&path, "\nHORCM_MON\n127.0.0.1 31200 6000 3000\nHORCM_CMD\n").unwrap();

        shell.write_instance_conf(INSTANCE_MAIN, dir.path()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("HORCM_CMD\n\\\\.\\CMD-492015:/dev/sd\n"));

        // Idempotent: a second pass leaves the file unchanged.
        shell.write_instance_conf(INSTANCE_MAIN, dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }
}
