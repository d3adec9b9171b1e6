//! iSCSI operations
//!
//! Port discovery resolves each port's portal address; targets are keyed
//! by the initiator IQN. Target IQNs are looked up lazily and cached,
//! since they are only needed to assemble connection properties.

use crate::cli::invoker::{ExecOptions, HorcmShell, SuccessCodes, EX_ENOOBJ};
use crate::cli::parser::{find_text, Field};
use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::protocol::{
    ChapAuth, ConnectionProperties, HostDescriptor, PortDiscovery, ProtocolOps, StorageState,
};
use crate::target::TargetSet;
use crate::{PAIR_TARGET_NAME, TARGET_IQN_SUFFIX, TARGET_PREFIX};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// iSCSI target port row
static ISCSI_PORT_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(CL\w-\w)\w* +ISCSI +TAR +\w+ +\w+ +\w +\w+ +Y ").unwrap());

static IPV4_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^IPV4_ADDR +: +(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})$").unwrap()
});

static TCP_PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^TCP_PORT +: +(\d+)$").unwrap());

const LINUX_HOST_MODE: [&str; 2] = ["-host_mode", "LINUX"];
const HMO_REPORT_FULL_PORTAL: &str = "83";
const HMO_DISABLE_IO_WAIT: &str = "91";

const NOT_FOUND_OK: [i32; 1] = [EX_ENOOBJ];

/// A host-group listing row: gid, group name, target IQN
struct GroupRow {
    gid: String,
    name: String,
    iqn: String,
}

fn group_rows(stdout: &str) -> Vec<GroupRow> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= 4
            && tokens[0].starts_with("CL")
            && tokens[1].bytes().all(|b| b.is_ascii_digit())
        {
            rows.push(GroupRow {
                gid: tokens[1].to_string(),
                name: tokens[2].to_string(),
                iqn: tokens[3].to_string(),
            });
        }
    }
    rows
}

/// First registered-initiator row carrying the host's IQN
fn gid_with_initiator(stdout: &str, iqn: &str) -> Option<String> {
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= 4 && tokens[0].starts_with("CL") && tokens[3] == iqn {
            return Some(tokens[1].to_string());
        }
    }
    None
}

/// iSCSI implementation of the protocol operations
pub struct IscsiProtocol {
    shell: Arc<HorcmShell>,
}

impl IscsiProtocol {
    pub fn new(shell: Arc<HorcmShell>) -> Self {
        Self { shell }
    }

    /// Resolve a port's portal address; `None` when it has no usable one
    async fn portal(&self, port: &str) -> Result<Option<String>> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "port", "-port", port, "-key", "opt"],
                ExecOptions::default(),
            )
            .await?;
        let addr = IPV4_ADDR
            .captures(&result.stdout)
            .map(|caps| caps[1].to_string());
        let tcp_port = TCP_PORT
            .captures(&result.stdout)
            .map(|caps| caps[1].to_string());
        Ok(match (addr, tcp_port) {
            (Some(addr), Some(tcp_port)) => Some(format!("{}:{}", addr, tcp_port)),
            _ => None,
        })
    }

    /// Target IQN for a (port, gid), from the cache or the array
    async fn target_iqn(&self, state: &StorageState, port: &str, gid: &str) -> Result<String> {
        let key = (port.to_string(), gid.to_string());
        if let Some(iqn) = state.iqns.read().get(&key) {
            return Ok(iqn.clone());
        }
        let result = self
            .shell
            .run_raidcom(&["get", "host_grp", "-port", port], ExecOptions::default())
            .await?;
        let row = group_rows(&result.stdout)
            .into_iter()
            .find(|row| row.gid == gid)
            .ok_or_else(|| Error::ResourceNotFound {
                resource: "Target IQN".into(),
            })?;
        debug!(port = %port, gid = %gid, iqn = %row.iqn, "found target IQN of host group");
        state.iqns.write().insert(key, row.iqn.clone());
        Ok(row.iqn)
    }

    fn initiator_iqn(&self, host: &HostDescriptor) -> Result<String> {
        host.iqn.clone().ok_or_else(|| Error::ResourceNotFound {
            resource: "iSCSI initiator IQN".into(),
        })
    }
}

#[async_trait]
impl ProtocolOps for IscsiProtocol {
    fn protocol(&self) -> Protocol {
        Protocol::Iscsi
    }

    fn host_ids(&self, host: &HostDescriptor) -> Result<Vec<String>> {
        Ok(vec![self.initiator_iqn(host)?])
    }

    async fn discover_ports(&self) -> Result<PortDiscovery> {
        let config = self.shell.config.clone();
        let result = self
            .shell
            .run_raidcom(&["get", "port"], ExecOptions::default())
            .await?;

        let mut discovery = PortDiscovery::default();
        let listed: Vec<String> = ISCSI_PORT_ROW
            .captures_iter(&result.stdout)
            .map(|caps| caps[1].to_string())
            .collect();
        for port in listed {
            if config.target_ports.contains(&port) {
                if let Some(portal) = self.portal(&port).await? {
                    discovery.portals.insert(port.clone(), portal);
                    discovery.ports.push(port.clone());
                }
            }
            if config.compute_target_ports.contains(&port) {
                let known = discovery.portals.contains_key(&port);
                let portal = if known {
                    None
                } else {
                    self.portal(&port).await?
                };
                if known || portal.is_some() {
                    if let Some(portal) = portal {
                        discovery.portals.insert(port.clone(), portal);
                    }
                    discovery.compute_ports.push(port.clone());
                }
            }
            if config.pair_target_ports.contains(&port) {
                discovery.pair_ports.push(port.clone());
            }
        }
        discovery.check(&config)?;
        debug!(portals = ?discovery.portals, "discovered iSCSI target ports");
        Ok(discovery)
    }

    async fn find_targets(
        &self,
        state: &StorageState,
        host: &HostDescriptor,
        ports: &[String],
        targets: &mut TargetSet,
    ) -> Result<usize> {
        let target_name = format!("{}{}", TARGET_PREFIX, host.ip);
        let initiator = self.initiator_iqn(host)?;
        let mut misses = 0;

        for port in ports {
            targets.info.insert(port.clone(), false);

            // Fast path: the group with the well-known name.
            let result = self
                .shell
                .run_raidcom(
                    &["get", "hba_iscsi", "-port", port, &target_name],
                    ExecOptions::default().success(SuccessCodes::HorcmPlus(&NOT_FOUND_OK)),
                )
                .await?;
            if let Some(gid) = gid_with_initiator(&result.stdout, &initiator) {
                debug!(port = %port, gid = %gid, "found initiator IQN in target");
                targets.info.insert(port.clone(), true);
                targets.list.push((port.clone(), gid.clone()));
                // Warm the IQN cache while the listing is cheap to fetch.
                let cached = state.iqns.read().contains_key(&(port.clone(), gid.clone()));
                if !cached {
                    let _ = self.target_iqn(state, port, &gid).await;
                }
                continue;
            }
            if self.shell.config.name_only_discovery {
                misses += 1;
                continue;
            }

            // Fallback: probe every driver-owned target on the port.
            let listing = self
                .shell
                .run_raidcom(&["get", "host_grp", "-port", port], ExecOptions::default())
                .await?;
            let mut found = false;
            for row in group_rows(&listing.stdout) {
                if !row.name.starts_with(TARGET_PREFIX) || row.name == PAIR_TARGET_NAME {
                    continue;
                }
                let target = format!("{}-{}", port, row.gid);
                let result = self
                    .shell
                    .run_raidcom(
                        &["get", "hba_iscsi", "-port", &target],
                        ExecOptions::default(),
                    )
                    .await?;
                if gid_with_initiator(&result.stdout, &initiator).is_some() {
                    debug!(port = %port, gid = %row.gid, "found initiator IQN in target");
                    targets.info.insert(port.clone(), true);
                    targets.list.push((port.clone(), row.gid.clone()));
                    state
                        .iqns
                        .write()
                        .insert((port.clone(), row.gid), row.iqn);
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
        host_ids: Option<&[String]>,
    ) -> Result<String> {
        let mut args = vec!["add", "host_grp", "-port", port, "-host_grp_name", name];
        let target_iqn = host_ids
            .and_then(|ids| ids.first())
            .map(|iqn| format!("{}{}", iqn, TARGET_IQN_SUFFIX));
        if let Some(target_iqn) = &target_iqn {
            args.push("-iscsi_name");
            args.push(target_iqn);
        }
        let result = self.shell.run_raidcom(&args, ExecOptions::default()).await?;
        find_text(&result.stdout, Field::Gid).ok_or_else(|| Error::ResourceNotFound {
            resource: "iSCSI target ID".into(),
        })
    }

    async fn set_target_mode(&self, port: &str, gid: &str) -> Result<()> {
        let target = format!("{}-{}", port, gid);
        let mut args = vec!["modify", "host_grp", "-port", &target];
        args.extend(LINUX_HOST_MODE);
        args.push("-host_mode_opt");
        args.push(HMO_REPORT_FULL_PORTAL);
        if self.shell.config.disable_io_wait {
            args.push("-host_mode_opt");
            args.push(HMO_DISABLE_IO_WAIT);
        }
        self.shell.run_raidcom(&args, ExecOptions::default()).await?;
        Ok(())
    }

    async fn register_host_ids(&self, port: &str, gid: &str, host_ids: &[String]) -> Result<()> {
        let target = format!("{}-{}", port, gid);
        let iqn = host_ids.first().ok_or_else(|| Error::ResourceNotFound {
            resource: "iSCSI initiator IQN".into(),
        })?;
        self.shell
            .run_raidcom(
                &[
                    "add",
                    "hba_iscsi",
                    "-port",
                    &target,
                    "-hba_iscsi_name",
                    iqn,
                ],
                ExecOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn connection_properties(
        &self,
        state: &StorageState,
        targets: &TargetSet,
        lun: u64,
        host: &HostDescriptor,
    ) -> Result<ConnectionProperties> {
        let selected: &[(String, String)] = if host.multipath {
            &targets.list
        } else {
            &targets.list[..1]
        };

        let mut portals = Vec::new();
        let mut iqns = Vec::new();
        for (port, gid) in selected {
            let portal = state
                .portals
                .get(port)
                .cloned()
                .ok_or_else(|| Error::ResourceNotFound {
                    resource: "Target portal".into(),
                })?;
            portals.push(portal);
            iqns.push(self.target_iqn(state, port, gid).await?);
        }

        let config = &self.shell.config;
        let auth = if config.use_chap_auth {
            Some(ChapAuth {
                user: config.auth_user.clone().unwrap_or_default(),
                password: config.auth_password.clone().unwrap_or_default(),
            })
        } else {
            None
        };

        let luns = vec![lun; selected.len()];
        Ok(ConnectionProperties::Iscsi {
            portals,
            iqns,
            luns,
            auth,
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
CL1-A ISCSI TAR AUT 01 Y PtoP Y 0 None - -
CL1-B ISCSI TAR AUT 01 Y PtoP Y 0 None - -
";

    fn protocol(runner: Arc<ScriptedRunner>) -> IscsiProtocol {
        let config = Arc::new(DriverConfig {
            serial: "492015".into(),
            pool: "30".into(),
            protocol: Protocol::Iscsi,
            target_ports: vec!["CL1-A".into(), "CL1-B".into()],
            pair_target_ports: vec!["CL1-A".into()],
            user: "user".into(),
            password: "secret".into(),
            ..DriverConfig::default()
        });
        IscsiProtocol::new(HorcmShell::new(runner, config, LockRegistry::new()))
    }

    fn host() -> HostDescriptor {
        HostDescriptor {
            ip: "127.0.0.1".into(),
            wwpns: Vec::new(),
            iqn: Some("iqn-initiator".into()),
            multipath: false,
        }
    }

    fn state() -> Arc<StorageState> {
        let mut discovery = PortDiscovery::default();
        discovery.portals.insert("CL1-A".into(), "192.168.1.1:3260".into());
        discovery.portals.insert("CL1-B".into(), "192.168.6.1:3260".into());
        StorageState::new(
            &DriverConfig {
                serial: "492015".into(),
                ..DriverConfig::default()
            },
            30,
            discovery,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_discover_ports_resolves_portals() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom get port -port CL1-A -key opt",
            CommandResult::ok("TCP_PORT : 3260\nIPV4_ADDR : 192.168.1.1\n"));
        runner.on("raidcom get port -port CL1-B -key opt",
            CommandResult::ok("TCP_PORT : 3260\nIPV4_ADDR : 192.168.6.1\n"));
        runner.on("raidcom get port -s", CommandResult::ok(GET_PORT));
        let protocol = protocol(runner);

        let discovery = protocol.discover_ports().await.unwrap();
        assert_eq!(discovery.ports, vec!["CL1-A".to_string(), "CL1-B".to_string()]);
        assert_eq!(
            discovery.portals.get("CL1-A").map(String::as_str),
            Some("192.168.1.1:3260")
        );
        assert_eq!(discovery.pair_ports, vec!["CL1-A".to_string()]);
    }

    #[tokio::test]
    async fn test_port_without_portal_is_skipped() {
        let runner = ScriptedRunner::new();
        runner.on("raidcom get port -port CL1-A -key opt",
            CommandResult::ok("TCP_PORT : 3260\nIPV4_ADDR : 192.168.1.1\n"));
        // CL1-B reports no address: unusable as a target port.
        runner.on("raidcom get port -port CL1-B -key opt",
            CommandResult::ok("TCP_PORT : 3260\n"));
        runner.on("raidcom get port -s", CommandResult::ok(GET_PORT));
        let protocol = protocol(runner);

        let discovery = protocol.discover_ports().await.unwrap();
        assert_eq!(discovery.ports, vec!["CL1-A".to_string()]);
    }

    #[tokio::test]
    async fn test_find_targets_direct_lookup_caches_iqn() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get hba_iscsi -port CL1-A AMG-127.0.0.1",
            CommandResult::ok("CL1-A 0 AMG-127.0.0.1 iqn-initiator 492015 NICK_NAME\n"),
        );
        runner.on(
            "raidcom get host_grp -port CL1-A",
            CommandResult::ok("CL1-A 0 AMG-127.0.0.1 iqn-initiator.target B S 492015 L 8\n"),
        );
        let protocol = protocol(runner);
        let state = state();

        let mut targets = TargetSet::new();
        let misses = protocol
            .find_targets(&state, &host(), &["CL1-A".to_string()], &mut targets)
            .await
            .unwrap();

        assert_eq!(misses, 0);
        assert_eq!(targets.list, vec![("CL1-A".to_string(), "0".to_string())]);
        assert_eq!(
            state
                .iqns
                .read()
                .get(&("CL1-A".to_string(), "0".to_string()))
                .map(String::as_str),
            Some("iqn-initiator.target")
        );
    }

    #[tokio::test]
    async fn test_find_targets_enumeration_fallback() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom get hba_iscsi -port CL1-A AMG-127.0.0.1",
            CommandResult::failed(EX_ENOOBJ, ""),
        );
        runner.on(
            "raidcom get host_grp -port CL1-A",
            CommandResult::ok(
                "CL1-A 0 AMG-10.0.0.9 iqn-other.target B S 492015 L 8\n\
                 CL1-A 1 AMG-legacy iqn-legacy.target B S 492015 L 8\n\
                 CL1-A 2 AMG-pair00 iqn-pair.target B S 492015 L 8\n",
            ),
        );
        runner.on(
            "raidcom get hba_iscsi -port CL1-A-0",
            CommandResult::ok("CL1-A 0 AMG-10.0.0.9 iqn-else 492015 -\n"),
        );
        runner.on(
            "raidcom get hba_iscsi -port CL1-A-1",
            CommandResult::ok("CL1-A 1 AMG-legacy iqn-initiator 492015 -\n"),
        );
        let protocol = protocol(runner);
        let state = state();

        let mut targets = TargetSet::new();
        let misses = protocol
            .find_targets(&state, &host(), &["CL1-A".to_string()], &mut targets)
            .await
            .unwrap();

        assert_eq!(misses, 0);
        assert_eq!(targets.list, vec![("CL1-A".to_string(), "1".to_string())]);
        assert_eq!(
            state
                .iqns
                .read()
                .get(&("CL1-A".to_string(), "1".to_string()))
                .map(String::as_str),
            Some("iqn-legacy.target")
        );
    }

    #[tokio::test]
    async fn test_create_target_seeds_target_iqn() {
        let runner = ScriptedRunner::new();
        runner.on(
            "raidcom add host_grp",
            CommandResult::ok("raidcom: Host group ID 0(0x0) will be used for adding.\n"),
        );
        let protocol = protocol(runner.clone());

        let ids = vec!["iqn-initiator".to_string()];
        let gid = protocol
            .create_target("CL1-A", "AMG-127.0.0.1", Some(&ids))
            .await
            .unwrap();
        assert_eq!(gid, "0");
        assert_eq!(
            runner.calls_matching(
                "raidcom add host_grp -port CL1-A -host_grp_name AMG-127.0.0.1 \
                 -iscsi_name iqn-initiator.amg-target"
            ),
            1
        );

        // The reserved pair group is created without a seeded IQN.
        protocol
            .create_target("CL1-A", PAIR_TARGET_NAME, None)
            .await
            .unwrap();
        assert_eq!(
            runner.calls_matching("raidcom add host_grp -port CL1-A -host_grp_name AMG-pair00 -s"),
            1
        );
    }

    #[tokio::test]
    async fn test_connection_properties_multipath() {
        let runner = ScriptedRunner::new();
        let protocol = protocol(runner);
        let state = state();
        state
            .iqns
            .write()
            .insert(("CL1-A".into(), "0".into()), "iqn-a.target".into());
        state
            .iqns
            .write()
            .insert(("CL1-B".into(), "0".into()), "iqn-b.target".into());

        let mut targets = TargetSet::new();
        targets.list.push(("CL1-A".into(), "0".into()));
        targets.list.push(("CL1-B".into(), "0".into()));

        let mut multipath_host = host();
        multipath_host.multipath = true;

        let props = protocol
            .connection_properties(&state, &targets, 3, &multipath_host)
            .await
            .unwrap();
        match props {
            ConnectionProperties::Iscsi {
                portals,
                iqns,
                luns,
                auth,
            } => {
                assert_eq!(
                    portals,
                    vec!["192.168.1.1:3260".to_string(), "192.168.6.1:3260".to_string()]
                );
                assert_eq!(
                    iqns,
                    vec!["iqn-a.target".to_string(), "iqn-b.target".to_string()]
                );
                // Multipath requires the same LUN on every path.
                assert_eq!(luns, vec![3, 3]);
                assert!(auth.is_none());
            }
            _ => panic!("expected iSCSI properties"),
        }
    }

    #[tokio::test]
    async fn test_connection_properties_single_path() {
        let runner = ScriptedRunner::new();
        let protocol = protocol(runner);
        let state = state();
        state
            .iqns
            .write()
            .insert(("CL1-A".into(), "0".into()), "iqn-a.target".into());

        let mut targets = TargetSet::new();
        targets.list.push(("CL1-A".into(), "0".into()));
        targets.list.push(("CL1-B".into(), "0".into()));

        let props = protocol
            .connection_properties(&state, &targets, 5, &host())
            .await
            .unwrap();
        match props {
            ConnectionProperties::Iscsi { portals, luns, .. } => {
                assert_eq!(portals.len(), 1);
                assert_eq!(luns, vec![5]);
            }
            _ => panic!("expected iSCSI properties"),
        }
    }
}
