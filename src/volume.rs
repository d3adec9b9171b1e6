//! Volume façade
//!
//! The thin operation surface consumed by an orchestration layer. Every
//! operation is a short delegation into the device allocator, the pair
//! state machine and the mapping reconciler; the interesting work happens
//! below. `setup` wires the whole driver: configuration files, control
//! processes, authentication, port discovery and the pair-target
//! bootstrap.

use crate::cli::invoker::{ExecOptions, HorcmShell};
use crate::cli::parser::{find_text, Field};
use crate::cli::runner::CommandRunnerRef;
use crate::config::{CopyMethod, DriverConfig, INSTANCE_MAIN, INSTANCE_PAIR};
use crate::device::{DeviceManager, BLOCKS_PER_GB};
use crate::error::{Error, Result};
use crate::lock::LockRegistry;
use crate::pair::PairManager;
use crate::protocol::{
    ConnectionProperties, HostDescriptor, PortDiscovery, ProtocolFactory, ProtocolOpsRef,
    StorageState,
};
use crate::target::{MappingReconciler, TargetSet};
use crate::PAIR_TARGET_NAME;
use serde::ser::Serializer;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Volume type recorded for ordinary devices
pub const NORMAL_LDEV_TYPE: &str = "Normal";
/// Volume type recorded for thin-copy virtual volumes
pub const VVOL_LDEV_TYPE: &str = "V-VOL";

// =============================================================================
// Façade Types
// =============================================================================

/// Metadata returned alongside a provisioned volume
#[derive(Debug, Clone, Serialize)]
pub struct VolumeMetadata {
    pub ldev: u32,
    pub ldev_type: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A provisioned volume: its location id plus metadata
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedVolume {
    /// Location id handed back to the orchestration layer; resolves the
    /// backing device on later calls
    pub location: String,
    pub metadata: VolumeMetadata,
}

/// Pool capacity in GB, or unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Gb(u64),
    Infinite,
}

impl Serialize for Capacity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Capacity::Gb(gb) => serializer.serialize_u64(*gb),
            Capacity::Infinite => serializer.serialize_str("infinite"),
        }
    }
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capacity::Gb(gb) => write!(f, "{}", gb),
            Capacity::Infinite => write!(f, "infinite"),
        }
    }
}

/// Pool capacity report
#[derive(Debug, Clone, Serialize)]
pub struct PoolCapacity {
    pub total_gb: Capacity,
    pub free_gb: Capacity,
}

/// Parse a location id; digits only, `None` for anything else
fn parse_location(location: Option<&str>) -> Option<u32> {
    let location = location?;
    if location.is_empty() || !location.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    location.parse().ok()
}

// =============================================================================
// Volume Driver
// =============================================================================

/// The assembled driver
pub struct VolumeDriver {
    config: Arc<DriverConfig>,
    shell: Arc<HorcmShell>,
    state: Arc<StorageState>,
    devices: Arc<DeviceManager>,
    pairs: Arc<PairManager>,
    reconciler: Arc<MappingReconciler>,
    protocol: ProtocolOpsRef,
}

impl VolumeDriver {
    /// Wire up the driver against the array
    pub async fn setup(config: DriverConfig, runner: CommandRunnerRef) -> Result<Arc<Self>> {
        Self::setup_with(config, runner, Path::new("/etc")).await
    }

    /// Like [`setup`](Self::setup), with the control-process configuration
    /// directory made explicit
    pub async fn setup_with(
        config: DriverConfig,
        runner: CommandRunnerRef,
        conf_dir: &Path,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let shell = HorcmShell::new(runner, config.clone(), LockRegistry::new());

        if config.add_conf {
            shell.write_instance_conf(INSTANCE_MAIN, conf_dir)?;
            shell.write_instance_conf(INSTANCE_PAIR, conf_dir)?;
        }
        shell.restart_instance(INSTANCE_MAIN).await?;
        shell.restart_instance(INSTANCE_PAIR).await?;
        shell.login().await?;
        let (cli_name, cli_version) = shell.cli_info().await;
        info!("{} version: {}", cli_name, cli_version);

        let protocol = ProtocolFactory::create(shell.clone())?;
        let discovery = protocol.discover_ports().await?;
        let pool_id = Self::resolve_pool_id(&shell).await?;
        let pair_targets =
            Self::init_pair_targets(&shell, &protocol, &discovery).await?;
        let state = StorageState::new(&config, pool_id, discovery, pair_targets);

        let devices = DeviceManager::new(shell.clone());
        let reconciler = MappingReconciler::new(shell.clone(), protocol.clone());
        let pairs = PairManager::new(
            shell.clone(),
            devices.clone(),
            reconciler.clone(),
            state.clone(),
        );

        info!(pool_id, protocol = %config.protocol, "storage backend ready");
        Ok(Arc::new(Self {
            config,
            shell,
            state,
            devices,
            pairs,
            reconciler,
            protocol,
        }))
    }

    /// A numeric pool is its own id; a named pool is resolved by scanning
    /// the pool listing
    async fn resolve_pool_id(shell: &HorcmShell) -> Result<u32> {
        let pool = &shell.config.pool;
        if pool.bytes().all(|b| b.is_ascii_digit()) {
            return pool.parse().map_err(|_| Error::PoolNotFound {
                pool: pool.clone(),
            });
        }
        let result = shell
            .run_raidcom(&["get", "pool", "-key", "opt"], ExecOptions::default())
            .await?;
        for line in result.stdout.lines().skip(1) {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() >= 4 && tokens[3] == pool {
                if let Ok(id) = tokens[0].parse() {
                    return Ok(id);
                }
            }
        }
        Err(Error::PoolNotFound { pool: pool.clone() })
    }

    /// Locate or create the reserved pair-dedicated group on every pair
    /// port; per-port failures are skipped, an empty result is fatal
    async fn init_pair_targets(
        shell: &HorcmShell,
        protocol: &ProtocolOpsRef,
        discovery: &PortDiscovery,
    ) -> Result<Vec<(String, String)>> {
        let ports = if discovery.pair_ports.is_empty() {
            &discovery.ports
        } else {
            &discovery.pair_ports
        };

        let mut pair_targets = Vec::new();
        for port in ports {
            let result = shell
                .run_raidcom(&["get", "host_grp", "-port", port], ExecOptions::default())
                .await?;
            let gid = match find_text(&result.stdout, Field::PairGid) {
                Some(gid) => gid,
                None => match protocol.create_target(port, PAIR_TARGET_NAME, None).await {
                    Ok(gid) => {
                        debug!(port = %port, gid = %gid, "created host group for pair operation");
                        gid
                    }
                    Err(_) => {
                        warn!(port = %port, "a pair host group could not be added");
                        continue;
                    }
                },
            };
            pair_targets.push((port.clone(), gid));
        }

        if pair_targets.is_empty() {
            return Err(Error::NoPairTarget);
        }
        pair_targets.sort();
        pair_targets.reverse();
        debug!(?pair_targets, "pair targets ready");
        Ok(pair_targets)
    }

    fn provisioned(&self, ldev: u32, ldev_type: &str) -> ProvisionedVolume {
        ProvisionedVolume {
            location: ldev.to_string(),
            metadata: VolumeMetadata {
                ldev,
                ldev_type: ldev_type.to_string(),
                created_at: chrono::Utc::now(),
            },
        }
    }

    fn map_busy(location: &str, err: Error) -> Error {
        if err.is_busy() {
            Error::VolumeBusy {
                location: location.to_string(),
            }
        } else {
            err
        }
    }

    /// Tear down pairs, then the device itself
    async fn delete_ldev(&self, ldev: u32) -> Result<()> {
        self.pairs.delete(ldev, true).await?;
        self.devices.delete(ldev).await
    }

    /// Create a copy of `pvol` on the storage side and return the new
    /// device, deleting it again if the pair cannot be established
    async fn copy_volume(
        &self,
        source: Option<&str>,
        size_gb: u64,
        method: Option<CopyMethod>,
    ) -> Result<ProvisionedVolume> {
        let pvol = parse_location(source).ok_or_else(|| Error::VolumeNotFound {
            location: source.unwrap_or_default().to_string(),
        })?;
        self.pairs.check_copy_source(pvol).await?;

        let src_blocks = self
            .devices
            .query(pvol)
            .await?
            .size_blocks
            .ok_or_else(|| Error::SourceUnavailable { ldev: pvol })?;
        if src_blocks != size_gb * BLOCKS_PER_GB {
            return Err(Error::InvalidParameter(
                "size: a copy must match the source volume size".into(),
            ));
        }

        let method = method.unwrap_or(self.config.default_copy_method);
        let is_thin = method == CopyMethod::Thin;
        if is_thin && self.config.thin_pool.is_none() {
            return Err(Error::InvalidParameter("thin_pool".into()));
        }

        let svol = self.devices.create(size_gb, is_thin).await?;
        if let Err(err) = self.pairs.create(pvol, svol, is_thin).await {
            if self.delete_ldev(svol).await.is_err() {
                warn!(ldev = svol, "failed to delete a logical device");
            }
            return Err(err);
        }

        let ldev_type = if is_thin {
            VVOL_LDEV_TYPE
        } else {
            NORMAL_LDEV_TYPE
        };
        Ok(self.provisioned(svol, ldev_type))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Create a volume of `size_gb`
    pub async fn create_volume(&self, size_gb: u64) -> Result<ProvisionedVolume> {
        let ldev = self.devices.create(size_gb, false).await?;
        Ok(self.provisioned(ldev, NORMAL_LDEV_TYPE))
    }

    /// Delete a volume; an absent or never-finalized location is a logged
    /// no-op, never an error
    pub async fn delete_volume(&self, location: Option<&str>) -> Result<()> {
        let ldev = match parse_location(location) {
            Some(ldev) => ldev,
            None => {
                warn!(?location, "failed to specify a logical device to be deleted");
                return Ok(());
            }
        };
        self.delete_ldev(ldev)
            .await
            .map_err(|err| Self::map_busy(location.unwrap_or_default(), err))
    }

    /// Create a snapshot of a volume
    pub async fn create_snapshot(
        &self,
        source: Option<&str>,
        size_gb: u64,
        method: Option<CopyMethod>,
    ) -> Result<ProvisionedVolume> {
        self.copy_volume(source, size_gb, method).await
    }

    /// Delete a snapshot; same no-op semantics as volume deletion
    pub async fn delete_snapshot(&self, location: Option<&str>) -> Result<()> {
        self.delete_volume(location).await
    }

    /// Create a writable clone of a volume
    pub async fn create_cloned_volume(
        &self,
        source: Option<&str>,
        size_gb: u64,
        method: Option<CopyMethod>,
    ) -> Result<ProvisionedVolume> {
        self.copy_volume(source, size_gb, method).await
    }

    /// Grow a volume; pairs must be torn down first and virtual volumes
    /// cannot be extended
    pub async fn extend_volume(&self, location: Option<&str>, new_size_gb: u64) -> Result<()> {
        let ldev = parse_location(location).ok_or_else(|| Error::VolumeNotFound {
            location: location.unwrap_or_default().to_string(),
        })?;
        if self.devices.is_vvol(ldev).await? {
            return Err(Error::ExtendNotSupported {
                location: location.unwrap_or_default().to_string(),
            });
        }
        self.pairs
            .delete(ldev, true)
            .await
            .map_err(|err| Self::map_busy(location.unwrap_or_default(), err))?;

        let old_blocks = self
            .devices
            .query(ldev)
            .await?
            .size_blocks
            .ok_or_else(|| Error::SourceUnavailable { ldev })?;
        self.devices
            .extend(ldev, old_blocks / BLOCKS_PER_GB, new_size_gb)
            .await
    }

    /// Expose a volume to a host and return the attachment properties
    pub async fn initialize_connection(
        &self,
        location: Option<&str>,
        host: &HostDescriptor,
    ) -> Result<ConnectionProperties> {
        let ldev = parse_location(location).ok_or_else(|| Error::VolumeNotFound {
            location: location.unwrap_or_default().to_string(),
        })?;
        let ports = self.state.attach_ports(host, &self.config.host_ip).to_vec();
        let mut targets = self
            .reconciler
            .discover_targets(&self.state, host, &ports)
            .await?;
        targets.require()?;
        targets.list.sort();

        let lun = self.reconciler.map_ldev(&targets.list, ldev).await?;
        self.protocol
            .connection_properties(&self.state, &targets, lun, host)
            .await
    }

    /// Remove a host's paths to a volume
    pub async fn terminate_connection(
        &self,
        location: Option<&str>,
        host: &HostDescriptor,
    ) -> Result<()> {
        let ldev = match parse_location(location) {
            Some(ldev) => ldev,
            None => {
                warn!(?location, "failed to specify a logical device to be unmapped");
                return Ok(());
            }
        };
        let ports = self.state.attach_ports(host, &self.config.host_ip).to_vec();
        let mut targets = TargetSet::new();
        self.protocol
            .find_targets(&self.state, host, &ports, &mut targets)
            .await?;
        targets.require()?;

        let mapped = self
            .reconciler
            .find_mapped_targets(ldev, &ports, false)
            .await?;
        let unmap = self.reconciler.unmap_targets(&targets.list, &mapped);
        self.reconciler.unmap_ldev(&unmap, ldev).await
    }

    /// Take over an externally-created device
    pub async fn manage_existing(&self, external_ref: &str) -> Result<ProvisionedVolume> {
        let ldev = crate::config::parse_ldev_id(external_ref).ok_or_else(|| {
            Error::InvalidReference {
                reason: "a valid LDEV number must be specified".into(),
            }
        })?;
        Ok(self.provisioned(ldev, NORMAL_LDEV_TYPE))
    }

    /// Validate and size an externally-created device
    pub async fn manage_existing_get_size(&self, external_ref: &str) -> Result<u64> {
        let ldev = crate::config::parse_ldev_id(external_ref).ok_or_else(|| {
            Error::InvalidReference {
                reason: "a valid LDEV number must be specified".into(),
            }
        })?;
        self.devices.manageable_size_gb(ldev).await
    }

    /// Release a volume from management without deleting data; pairs must
    /// be split first and virtual volumes stay bound to their pool
    pub async fn unmanage(&self, location: Option<&str>) -> Result<()> {
        let ldev = match parse_location(location) {
            Some(ldev) => ldev,
            None => {
                warn!(?location, "failed to specify a logical device to be unmanaged");
                return Ok(());
            }
        };
        if self.devices.is_vvol(ldev).await? {
            return Err(Error::VolumeBusy {
                location: location.unwrap_or_default().to_string(),
            });
        }
        self.pairs
            .delete(ldev, true)
            .await
            .map_err(|err| Self::map_busy(location.unwrap_or_default(), err))
    }

    /// Pool capacity; `infinite` for pool types without a fixed ceiling
    pub async fn get_capacity(&self) -> Result<PoolCapacity> {
        let dp_pool = self
            .shell
            .run_raidcom(&["get", "dp_pool"], ExecOptions::default())
            .await?;
        let pool = self
            .shell
            .run_raidcom(&["get", "pool", "-key", "opt"], ExecOptions::default())
            .await?;

        let dp_caps = self.state.dp_pool_pattern.captures(&dp_pool.stdout);
        let pool_caps = self.state.pool_pattern.captures(&pool.stdout);
        let (dp_caps, pool_caps) = match (dp_caps, pool_caps) {
            (Some(dp_caps), Some(pool_caps)) => (dp_caps, pool_caps),
            _ => {
                return Err(Error::PoolNotFound {
                    pool: self.config.pool.clone(),
                })
            }
        };

        if &pool_caps[1] == "-" {
            return Ok(PoolCapacity {
                total_gb: Capacity::Infinite,
                free_gb: Capacity::Infinite,
            });
        }
        let virtualization: f64 = pool_caps[1].parse().map_err(|_| Error::PoolNotFound {
            pool: self.config.pool.clone(),
        })?;
        // Reported in binary-thousand units.
        let tp_cap: f64 = dp_caps[1].parse().unwrap_or(0.0) / 1024.0;
        let tl_cap: f64 = dp_caps[2].parse().unwrap_or(0.0) / 1024.0;

        let total_gb = (tp_cap * (virtualization / 100.0)).floor();
        let free_gb = (total_gb - tl_cap).floor();
        Ok(PoolCapacity {
            total_gb: Capacity::Gb(total_gb as u64),
            free_gb: Capacity::Gb(free_gb.max(0.0) as u64),
        })
    }
}
