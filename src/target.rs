//! Host target and LUN mapping reconciliation
//!
//! Determines which target ports already expose a host, creates host
//! groups on demand (best effort per port, with rollback when no host
//! identity can be registered), and reconciles a device's LUN paths
//! against the desired target list. A multipath attachment must use the
//! same LUN on every port; removal runs in reverse creation order.

use crate::cli::invoker::{
    ExecOptions, HorcmShell, SuccessCodes, ANOTHER_LDEV_MAPPED, DEFAULT_PROCESS_WAIT, EX_CMDRJE,
    EX_ENOOBJ, LU_PATH_DEFINED,
};
use crate::cli::parser::{find_int, find_list, Field};
use crate::error::{Error, Result};
use crate::protocol::{HostDescriptor, ProtocolOpsRef, StorageState};
use crate::{PAIR_TARGET_NAME, TARGET_PREFIX};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LUN_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const LUN_MAX_WAIT: Duration = Duration::from_secs(50);

/// Codes accepted when a mapping may already be gone
const ALREADY_ABSENT: [i32; 1] = [EX_ENOOBJ];

/// One mapped-path row of a LUN listing: port, gid, lun, path count, ldev
static LUN_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\S+) +(\d+) +\S+ +(\d+) +1 +(\d+) ").unwrap());

// =============================================================================
// Target Set
// =============================================================================

/// Aggregated discovery result across the desired ports
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    /// Whether each probed port exposes the host
    pub info: BTreeMap<String, bool>,
    /// Found or created (port, gid) targets
    pub list: Vec<(String, String)>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero usable targets is fatal for the aggregate operation
    pub fn require(&self) -> Result<()> {
        if self.list.is_empty() {
            return Err(Error::TargetNotFound);
        }
        Ok(())
    }
}

/// Validate one mapped-path row against the driver's target naming
fn is_owned_target(port_gid: &str, name: &str, ports: &[String], is_pair: bool) -> bool {
    let port_matches = port_gid.len() >= 5 && ports.iter().any(|p| p == &port_gid[..5]);
    if is_pair {
        return port_matches && name == PAIR_TARGET_NAME;
    }
    port_matches && name.starts_with(TARGET_PREFIX) && name != PAIR_TARGET_NAME
}

// =============================================================================
// Mapping Reconciler
// =============================================================================

/// Reconciles host groups and LUN paths for devices
pub struct MappingReconciler {
    shell: Arc<HorcmShell>,
    protocol: ProtocolOpsRef,
}

impl MappingReconciler {
    pub fn new(shell: Arc<HorcmShell>, protocol: ProtocolOpsRef) -> Arc<Self> {
        Arc::new(Self { shell, protocol })
    }

    /// Discover the host's targets on `ports`; optionally create missing
    /// ones when the configuration requests host-group management
    pub async fn discover_targets(
        &self,
        state: &StorageState,
        host: &HostDescriptor,
        ports: &[String],
    ) -> Result<TargetSet> {
        let mut targets = TargetSet::new();
        let misses = self
            .protocol
            .find_targets(state, host, ports, &mut targets)
            .await?;
        if misses > 0 && self.shell.config.group_request {
            self.create_missing_targets(state, host, &mut targets).await?;
        }
        Ok(targets)
    }

    /// Create a host group on every port where discovery found nothing.
    /// A per-port failure is logged and skipped; losing one port must not
    /// fail the whole attachment.
    async fn create_missing_targets(
        &self,
        state: &StorageState,
        host: &HostDescriptor,
        targets: &mut TargetSet,
    ) -> Result<()> {
        let host_ids = self.protocol.host_ids(host)?;
        let missing: Vec<String> = targets
            .info
            .iter()
            .filter(|(_, found)| !**found)
            .map(|(port, _)| port.clone())
            .collect();

        for port in missing {
            match self.create_target(host, &port, &host_ids).await {
                Ok(gid) => {
                    targets.info.insert(port.clone(), true);
                    targets.list.push((port, gid));
                }
                Err(_) => {
                    warn!(port = %port, "a host group could not be added");
                }
            }
        }

        if targets.list.is_empty() {
            // Another controller may have created the groups concurrently.
            let ports: Vec<String> = targets.info.keys().cloned().collect();
            self.protocol
                .find_targets(state, host, &ports, targets)
                .await?;
        }
        Ok(())
    }

    async fn create_target(
        &self,
        host: &HostDescriptor,
        port: &str,
        host_ids: &[String],
    ) -> Result<String> {
        let name = format!("{}{}", TARGET_PREFIX, host.ip);
        let gid = self
            .protocol
            .create_target(port, &name, Some(host_ids))
            .await?;
        debug!(port = %port, gid = %gid, target = %name, "created host group");

        let configured = async {
            self.protocol.set_target_mode(port, &gid).await?;
            self.protocol.register_host_ids(port, &gid, host_ids).await
        }
        .await;
        if let Err(err) = configured {
            // Leave no half-configured group behind.
            self.delete_target(port, &gid).await;
            return Err(err);
        }
        Ok(gid)
    }

    /// Delete a host group; failure is logged, not raised
    pub async fn delete_target(&self, port: &str, gid: &str) {
        let target = format!("{}-{}", port, gid);
        let result = self
            .shell
            .run_raidcom(
                &["delete", "host_grp", "-port", &target],
                ExecOptions::default().no_raise(),
            )
            .await;
        match result {
            Ok(result) if result.exit == 0 => {}
            _ => warn!(port = %port, gid = %gid, "a host group could not be deleted"),
        }
    }

    // =========================================================================
    // LUN paths
    // =========================================================================

    /// Map a device on every target, using one LUN for all of them
    ///
    /// The first target fixes the LUN (reusing an existing path if the
    /// array reports one); subsequent targets reuse it, logging rather
    /// than failing when a single port rejects the path.
    pub async fn map_ldev(&self, targets: &[(String, String)], ldev: u32) -> Result<u64> {
        let (port, gid) = &targets[0];
        let lun = self
            .add_lun(ldev, port, gid, None)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                resource: "LUN".into(),
            })?;
        for (port, gid) in &targets[1..] {
            if self.add_lun(ldev, port, gid, Some(lun)).await.is_err() {
                warn!(ldev, port, gid, lun, "failed to map a logical device");
            }
        }
        Ok(lun)
    }

    async fn add_lun(
        &self,
        ldev: u32,
        port: &str,
        gid: &str,
        lun: Option<u64>,
    ) -> Result<Option<u64>> {
        let target = format!("{}-{}", port, gid);
        let ldev_arg = ldev.to_string();
        let mut args = vec!["add", "lun", "-port", &target, "-ldev_id", &ldev_arg];
        let lun_arg = lun.map(|l| l.to_string());
        let ignore = match &lun_arg {
            Some(lun_arg) => {
                args.push("-lun_id");
                args.push(lun_arg);
                ANOTHER_LDEV_MAPPED
            }
            None => LU_PATH_DEFINED,
        };

        let opts = ExecOptions::default()
            .ignore(ignore)
            .interval(LUN_RETRY_INTERVAL)
            .timeout(LUN_MAX_WAIT);
        let result = self.shell.run_raidcom(&args, opts).await?;

        let assigned = match lun {
            None => {
                if result.exit == EX_CMDRJE {
                    // A path already exists for this device; reuse its LUN.
                    let existing = self.find_lun(ldev, port, gid).await?;
                    debug!(ldev, port, gid, ?existing, "path already defined");
                    existing
                } else {
                    find_int(&result.stdout, Field::Lun)
                }
            }
            Some(lun) => {
                if result.stderr.contains(ANOTHER_LDEV_MAPPED) {
                    warn!(ldev, port, gid, lun, "requested LUN carries another device");
                    return Ok(None);
                }
                Some(lun)
            }
        };
        debug!(ldev, port, gid, ?assigned, "created logical unit path");
        Ok(assigned)
    }

    /// Look up the LUN the array already assigned for a device on a group
    async fn find_lun(&self, ldev: u32, port: &str, gid: &str) -> Result<Option<u64>> {
        let target = format!("{}-{}", port, gid);
        let result = self
            .shell
            .run_raidcom(&["get", "lun", "-port", &target], ExecOptions::default())
            .await?;
        for caps in LUN_ROW.captures_iter(&result.stdout) {
            if &caps[1] == port
                && &caps[2] == gid
                && caps[4].parse::<u32>().ok() == Some(ldev)
            {
                return Ok(caps[3].parse().ok());
            }
        }
        Ok(None)
    }

    /// Mapped-path entries for a device, filtered to the driver's targets
    pub async fn find_mapped_targets(
        &self,
        ldev: u32,
        ports: &[String],
        is_pair: bool,
    ) -> Result<Vec<String>> {
        let result = self
            .shell
            .run_raidcom(
                &["get", "ldev", "-ldev_id", &ldev.to_string()],
                ExecOptions::default(),
            )
            .await?;
        let mut mapped = Vec::new();
        for entry in find_list(&result.stdout, Field::Ports).unwrap_or_default() {
            let tokens: Vec<&str> = entry.split_whitespace().collect();
            if tokens.len() >= 3 && is_owned_target(tokens[0], tokens[2], ports, is_pair) {
                mapped.push(tokens[0].to_string());
            }
        }
        Ok(mapped)
    }

    /// Removal set for a disconnect: mapped paths belonging to the
    /// discovered targets, in reverse creation order
    pub fn unmap_targets(
        &self,
        discovered: &[(String, String)],
        mapped: &[String],
    ) -> Vec<String> {
        let mut unmap: Vec<String> = mapped
            .iter()
            .filter(|mapping| {
                let port = if mapping.len() >= 5 { &mapping[..5] } else { "" };
                let gid = mapping.split('-').nth(2).unwrap_or("");
                discovered
                    .iter()
                    .any(|(p, g)| p == port && g == gid)
            })
            .cloned()
            .collect();
        unmap.sort();
        unmap.reverse();
        unmap
    }

    /// Unmap a device from each target, tolerating already-absent paths
    pub async fn unmap_ldev(&self, targets: &[String], ldev: u32) -> Result<()> {
        let ldev_arg = ldev.to_string();
        for target in targets {
            self.shell
                .run_raidcom(
                    &["delete", "lun", "-port", target, "-ldev_id", &ldev_arg],
                    ExecOptions::default()
                        .success(SuccessCodes::HorcmPlus(&ALREADY_ABSENT))
                        .interval(LUN_RETRY_INTERVAL)
                        .timeout(DEFAULT_PROCESS_WAIT),
                )
                .await?;
            debug!(ldev, target = %target, "deleted logical unit path");
        }
        Ok(())
    }
}
