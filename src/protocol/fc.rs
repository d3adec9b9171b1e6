//! Fibre Channel operations
//!
//! Port discovery harvests target WWNs from the port listing; host groups
//! are keyed by the connecting host's WWPNs, any of which may already be
//! registered under an existing group.

use crate::cli::invoker::{ExecOptions, HorcmShell, SuccessCodes, EX_ENOOBJ};
use crate::cli::parser::{find_text, Field};
use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::protocol::{
    ConnectionProperties, HostDescriptor, PortDiscovery, ProtocolOps, StorageState,
};
use crate::target::TargetSet;
use crate::{PAIR_TARGET_NAME, TARGET_PREFIX};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// FC target port row: port name and its WWN
static FC_PORT_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(CL\w-\w)\w* +(?:FIBRE|FCoE) +TAR +\w+ +\w+ +\w +\w+ +Y +\d+ +\d+ +(\w{16})")
        .unwrap()
});

const LINUX_HOST_MODE: [&str; 2] = ["-host_mode", "LINUX"];
const HMO_DISABLE_IO_WAIT: &str = "91";

const NOT_FOUND_OK: [i32; 1] = [EX_ENOOBJ];

/// Fibre Channel implementation of the protocol operations
pub struct FcProtocol {
    shell: Arc<HorcmShell>,
}

impl FcProtocol {
    pub fn new(shell: Arc<HorcmShell>) -> Self {
        Self { shell }
    }

    /// First group row whose registered WWN belongs to the host
    fn gid_with_wwpn(stdout: &str, wwpns: &[String]) -> Option<String> {
        for line in stdout.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() >= 4
                && tokens[0].starts_with("CL")
                && wwpns.iter().any(|w| w == tokens[3])
            {
                return Some(tokens[1].to_string());
            }
        }
        None
    }

    /// Driver-owned groups from a host-group listing, excluding the
    /// reserved pair group
    fn owned_groups(stdout: &str) -> Vec<String> {
        let mut gids = Vec::new();
        for line in stdout.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() >= 3
                && tokens[0].starts_with("CL")
                && tokens[1].bytes().all(|b| b.is_ascii_digit())
                && tokens[2].starts_with(TARGET_PREFIX)
                && tokens[2] != PAIR_TARGET_NAME
            {
                gids.push(tokens[1].to_string());
            }
        }
        gids
    }
}

#[async_trait]
impl ProtocolOps for FcProtocol {
    fn protocol(&self) -> Protocol {
        Protocol::Fc
    }

    fn host_ids(&self, host: &HostDescriptor) -> Result<Vec<String>> {
        if host.wwpns.is_empty() {
            return Err(Error::ResourceNotFound {
                resource: "World Wide Name".into(),
            });
        }
        Ok(host.wwpns.clone())
    }

    async fn discover_ports(&self) -> Result<PortDiscovery> {
        let config = &self.shell.config;
        let result = self
            .shell
            .run_raidcom(&["get", "port"], ExecOptions::default())
            .await?;

        let mut discovery = PortDiscovery::default();
        for caps in FC_PORT_ROW.captures_iter(&result.stdout) {
            let port = caps[1].to_string();
            let wwn = caps[2].to_string();
            if config.target_ports.contains(&port) {
                discovery.ports.push(port.clone());
                discovery.wwns.insert(port.clone(), wwn.clone());
            }
            if config.compute_target_ports.contains(&port) {
                discovery.compute_ports.push(port.clone());
                discovery.wwns.insert(port.clone(), wwn.clone());
            }
            if config.pair_target_ports.contains(&port) {
                discovery.pair_ports.push(port.clone());
            }
        }
        discovery.check(config)?;
        debug!(wwns = ?discovery.wwns, "discovered FC target ports");
        Ok(discovery)
    }

    async fn find_targets(
        &self,
        _state: &StorageState,
        host: &HostDescriptor,
        ports: &[String],
        targets: &mut TargetSet,
    ) -> Result<usize> {
        let target_name = format!("{}{}", TARGET_PREFIX, host.ip);
        let wwpns = self.host_ids(host)?;
        let mut misses = 0;

        for port in ports {
            targets.info.insert(port.clone(), false);

            // Fast path: the group with the well-known name.
            let result = self
                .shell
                .run_raidcom(
                    &["get", "hba_wwn", "-port", port, &target_name],
                    ExecOptions::default().success(SuccessCodes::HorcmPlus(&NOT_FOUND_OK)),
                )
                .await?;
            if let Some(gid) = Self::gid_with_wwpn(&result.stdout, &wwpns) {
                debug!(port = %port, gid = %gid, "found WWPNs in host group");
                targets.info.insert(port.clone(), true);
                targets.list.push((port.clone(), gid));
                continue;
            }
            if self.shell.config.name_only_discovery {
                misses += 1;
                continue;
            }

            // Fallback: probe every driver-owned group on the port.
            let listing = self
                .shell
                .run_raidcom(&["get", "host_grp", "-port", port], ExecOptions::default())
                .await?;
            let mut found = false;
            for gid in Self::owned_groups(&listing.stdout) {
                let target = format!("{}-{}", port, gid);
                let result = self
                    .shell
                    .run_raidcom(&["get", "hba_wwn", "-port", &target], ExecOptions::default())
                    .await?;
                if Self::gid_with_wwpn(&result.stdout, &wwpns).is_some() {
                    debug!(port = %port, gid = %gid, "found WWPNs in host group");
                    targets.info.insert(port.clone(), true);
                    targets.list.push((port.clone(), gid));
                    found = true;
                    break;
                }
            }
            if !found {
                misses += 1;
            }
        }
        Ok(misses)
    }

    async fn create_target(
        &self,
        port: &str,
        name: &str,
        _host_ids: Option<&[String]>,
    ) -> Result<String> {
        let result = self
            .shell
            .run_raidcom(
                &["add", "host_grp", "-port", port, "-host_grp_name", name],
                ExecOptions::default(),
            )
            .await?;
        find_text(&result.stdout, Field::Gid).ok_or_else(|| Error::ResourceNotFound {
            resource: "host group ID".into(),
        })
    }

    async fn set_target_mode(&self, port: &str, gid: &str) -> Result<()> {
        let target = format!("{}-{}", port, gid);
        let mut args = vec!["modify", "host_grp", "-port", &target];
        args.extend(LINUX_HOST_MODE);
        if self.shell.config.disable_io_wait {
            args.push("-host_mode_opt");
            args.push(HMO_DISABLE_IO_WAIT);
        }
        self.shell
            .run_raidcom(&args, ExecOptions::default().success(SuccessCodes::All))
            .await?;
        Ok(())
    }

    async fn register_host_ids(&self, port: &str, gid: &str, host_ids: &[String]) -> Result<()> {
        let target = format!("{}-{}", port, gid);
        let mut registered = 0usize;
        for wwn in host_ids {
            let result = self
                .shell
                .run_raidcom(
                    &["add", "hba_wwn", "-port", &target, "-hba_wwn", wwn],
                    ExecOptions::default(),
                )
                .await;
            match result {
                Ok(_) => registered += 1,
                Err(_) => warn!(port = %port, gid = %gid, wwn = %wwn, "failed to assign the WWN"),
            }
        }
        if registered == 0 {
            return Err(Error::HostIdRegistrationFailed {
                port: port.to_string(),
                gid: gid.to_string(),
            });
        }
        Ok(())
    }

    async fn connection_properties(
        &self,
        state: &StorageState,
        targets: &TargetSet,
        lun: u64,
        _host: &HostDescriptor,
    ) -> Result<ConnectionProperties> {
        let target_wwns = targets
            .info
            .iter()
            .filter(|(_, found)| **found)
            .filter_map(|(port, _)| state.wwns.get(port).cloned())
            .collect();
        Ok(ConnectionProperties::Fc {
            target_wwns,
            target_lun: lun,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::runner::{CommandResult, ScriptedRunner};
    use crate::config::DriverConfig;
    use crate::lock::LockRegistry;

    const GET_PORT: &str = "\
CL1-A FIBRE TAR AUT E8 N E8 Y 0 0 50060E8005B90C31
CL1-B FIBRE TAR AUT E8 N E8 Y 0 0 50060E8005B90C32
CL3-A ISCSI TAR AUT 01 Y PtoP Y 0 None - -
";

    /// Immediately-terminal failure code for scripted commands
    const INVARG: i32 = 253;

    fn protocol(runner: Arc<ScriptedRunner>, name_only: bool) -> FcProtocol {
        let config = Arc::new(DriverConfig {
            serial: "492015".into(),
            pool: "30".into(),
            name_only_discovery: name_only,
            target_ports: vec!["CL1-A".into(), "CL1-B".into()],
            pair_target_ports: vec!["CL1-A".into()],
            user: "user".into(),
            password: "secret".into(),
            ..DriverConfig::default()
        });
        FcProtocol::new(HorcmShell::new(runner, config, LockRegistry::new()))
    }

    fn host() -> HostDescriptor {
        HostDescriptor {
            ip: "127.0.0.1".into(),
            wwpns: vec!["0123456789abcdef".into()],
            iqn: None,
            multipath: false,
        }
    }

    fn empty_state() -> Arc<StorageState> {
        StorageState::new(
            &DriverConfig {
                serial: "492015".into(),
                ..DriverConfig::default()
            },
            30,
            PortDiscovery::default(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_discover_ports_collects_wwns() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom get port", CommandResult::ok(GET_PORT));
        let protocol = protocol(runner, false);

        let discovery = protocol.discover_ports().await.unwrap();
        assert_eq!(discovery.ports, vec!["CL1-A".to_string(), "CL1-B".to_string()]);
        assert_eq!(
            discovery.wwns.get("CL1-A").map(String::as_str),
            Some("50060E8005B90C31")
        );
        assert_eq!(discovery.pair_ports, vec!["CL1-A".to_string()]);
    }

    #[tokio::test]
    async fn test_find_targets_direct_lookup() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get hba_wwn -port CL1-A AMG-127.0.0.1",
            CommandResult::ok("CL1-A 0 AMG-127.0.0.1 0123456789abcdef 492015 -\n"),
        );
        runner.on(
            "raidcom get hba_wwn -port CL1-B AMG-127.0.0.1",
            CommandResult::failed(EX_ENOOBJ, ""),
        );
        let protocol = protocol(runner, true);

        let mut targets = TargetSet::new();
        let misses = protocol
            .find_targets(
                &empty_state(),
                &host(),
                &["CL1-A".to_string(), "CL1-B".to_string()],
                &mut targets,
            )
            .await
            .unwrap();

        assert_eq!(misses, 1);
        assert_eq!(targets.list, vec![("CL1-A".to_string(), "0".to_string())]);
        assert_eq!(targets.info.get("CL1-A"), Some(&true));
        assert_eq!(targets.info.get("CL1-B"), Some(&false));
    }

    #[tokio::test]
    async fn test_find_targets_enumeration_fallback() {
        let runner = ScriptedRunner::new();
        // Direct lookup misses on this port.
        runner.on(
            "raidcom get hba_wwn -port CL1-A AMG-127.0.0.1",
            CommandResult::failed(EX_ENOOBJ, ""),
        );
        runner.on(
            "raidcom get host_grp -port CL1-A",
            CommandResult::ok(
                "CL1-A 0 AMG-10.1.1.9 - B S 492015 L 8\n\
                 CL1-A 2 AMG-pair00 - B S 492015 L 8\n",
            ),
        );
        runner.on(
            "raidcom get hba_wwn -port CL1-A-0",
            CommandResult::ok("CL1-A 0 AMG-10.1.1.9 0123456789abcdef 492015 -\n"),
        );
        let protocol = protocol(runner, false);

        let mut targets = TargetSet::new();
        let misses = protocol
            .find_targets(&empty_state(), &host(), &["CL1-A".to_string()], &mut targets)
            .await
            .unwrap();

        assert_eq!(misses, 0);
        assert_eq!(targets.list, vec![("CL1-A".to_string(), "0".to_string())]);
    }

    #[tokio::test]
    async fn test_create_target_returns_gid() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom add host_grp -port CL1-A -host_grp_name AMG-127.0.0.1",
            CommandResult::ok("raidcom: Host group ID 1(0x1) will be used for adding.\n"),
        );
        let protocol = protocol(runner, false);

        let gid = protocol
            .create_target("CL1-A", "AMG-127.0.0.1", None)
            .await
            .unwrap();
        assert_eq!(gid, "1");
    }

    #[tokio::test]
    async fn test_register_host_ids_partial_failure_is_tolerated() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom add hba_wwn -port CL1-A-1 -hba_wwn bad0000000000000",
            CommandResult::failed(INVARG, ""),
        );
        let protocol = protocol(runner, false);

        // One of two WWNs registers; that is success.
        protocol
            .register_host_ids(
                "CL1-A",
                "1",
                &["bad0000000000000".into(), "0123456789abcdef".into()],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_host_ids_total_failure() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom add hba_wwn", CommandResult::failed(INVARG, ""));
        let protocol = protocol(runner, false);

        let err = protocol
            .register_host_ids("CL1-A", "1", &["0123456789abcdef".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HostIdRegistrationFailed { .. }));
    }

    #[tokio::test]
    async fn test_connection_properties() {
        let runner = ScriptedRunner::new();
        let protocol = protocol(runner, false);

        let config = DriverConfig {
            serial: "492015".into(),
            ..DriverConfig::default()
        };
        let mut discovery = PortDiscovery::default();
        discovery
            .wwns
            .insert("CL1-A".into(), "50060E8005B90C31".into());
        let state = StorageState::new(&config, 30, discovery, Vec::new());

        let mut targets = TargetSet::new();
        targets.info.insert("CL1-A".into(), true);
        targets.info.insert("CL1-B".into(), false);
        targets.list.push(("CL1-A".into(), "0".into()));

        let props = protocol
            .connection_properties(&state, &targets, 3, &host())
            .await
            .unwrap();
        match props {
            ConnectionProperties::Fc {
                target_wwns,
                target_lun,
            } => {
                assert_eq!(target_wwns, vec!["50060E8005B90C31".to_string()]);
                assert_eq!(target_lun, 3);
            }
            _ => panic!("expected FC properties"),
        }
    }
}
