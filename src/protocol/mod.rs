//! Transport-specific array operations
//!
//! One capability set - discover ports, create targets, register host
//! identities, assemble connection properties - with one implementation
//! per transport protocol. The implementation is selected once at setup
//! by a configuration-driven factory, never by runtime type inspection.

pub mod fc;
pub mod iscsi;

pub use fc::FcProtocol;
pub use iscsi::IscsiProtocol;

use crate::cli::invoker::HorcmShell;
use crate::config::{Dialect, DriverConfig, Protocol, INSTANCE_PAIR};
use crate::error::{Error, Result};
use crate::pair::MAX_MIRROR_UNITS;
use crate::target::TargetSet;
use crate::DRIVER_PREFIX;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Host Descriptor
// =============================================================================

/// Identity of a connecting host
#[derive(Debug, Clone, Default)]
pub struct HostDescriptor {
    /// Host address; also names the host group the driver creates for it
    pub ip: String,
    /// FC initiator port names
    pub wwpns: Vec<String>,
    /// iSCSI initiator IQN
    pub iqn: Option<String>,
    /// The host attaches through multiple paths
    pub multipath: bool,
}

// =============================================================================
// Connection Properties
// =============================================================================

/// CHAP credentials handed to the initiator
#[derive(Debug, Clone, Serialize)]
pub struct ChapAuth {
    pub user: String,
    pub password: String,
}

/// Protocol data returned from `initialize_connection`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "driver_volume_type", rename_all = "lowercase")]
pub enum ConnectionProperties {
    Fc {
        target_wwns: Vec<String>,
        target_lun: u64,
    },
    Iscsi {
        portals: Vec<String>,
        iqns: Vec<String>,
        luns: Vec<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth: Option<ChapAuth>,
    },
}

// =============================================================================
// Port Discovery
// =============================================================================

/// Ports harvested from the array at setup
#[derive(Debug, Clone, Default)]
pub struct PortDiscovery {
    pub ports: Vec<String>,
    pub compute_ports: Vec<String>,
    pub pair_ports: Vec<String>,
    /// Target WWN per FC port
    pub wwns: HashMap<String, String>,
    /// `ip:port` portal per iSCSI port
    pub portals: HashMap<String, String>,
}

impl PortDiscovery {
    /// Every configured port class must have resolved to something usable
    pub(crate) fn check(&self, config: &DriverConfig) -> Result<()> {
        if !config.target_ports.is_empty() && self.ports.is_empty() {
            return Err(Error::ResourceNotFound {
                resource: "Target ports".into(),
            });
        }
        if !config.compute_target_ports.is_empty() && self.compute_ports.is_empty() {
            return Err(Error::ResourceNotFound {
                resource: "Compute target ports".into(),
            });
        }
        if !config.pair_target_ports.is_empty() && self.pair_ports.is_empty() {
            return Err(Error::ResourceNotFound {
                resource: "Pair target ports".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Storage State
// =============================================================================

/// Array state assembled once during setup
///
/// Immutable after construction except for the lazily-filled target IQN
/// cache. Discovery results are the array's answers, not configuration:
/// a configured port missing here was rejected during setup.
pub struct StorageState {
    pub pool_id: u32,
    pub ports: Vec<String>,
    pub compute_ports: Vec<String>,
    pub pair_ports: Vec<String>,
    pub wwns: HashMap<String, String>,
    pub portals: HashMap<String, String>,
    /// Target IQN per (port, gid), filled on first use
    pub iqns: parking_lot::RwLock<HashMap<(String, String), String>>,
    /// Pair-dedicated host groups, sorted descending
    pub pair_targets: Vec<(String, String)>,
    /// Copy group name per mirror unit
    pub copy_groups: Vec<String>,
    /// Pool rows are anchored on the pool id
    pub dp_pool_pattern: Regex,
    pub pool_pattern: Regex,
}

impl StorageState {
    pub fn new(
        config: &DriverConfig,
        pool_id: u32,
        discovery: PortDiscovery,
        pair_targets: Vec<(String, String)>,
    ) -> Arc<Self> {
        let instance = config.instances[INSTANCE_PAIR];
        let copy_groups = (0..MAX_MIRROR_UNITS)
            .map(|mun| {
                format!(
                    "{}-{}{}{:03X}{}",
                    DRIVER_PREFIX, config.host_ip, config.serial, instance, mun
                )
            })
            .collect();
        let dp_pool_pattern = Regex::new(&format!(
            r"(?m)^{:03} +\S+ +\d+ +\d+ +(\d+) +\d+ +\d+ +\d+ +\w+ +\d+ +(\d+)",
            pool_id
        ))
        .unwrap();
        let pool_pattern = Regex::new(&format!(
            r"(?m)^{:03} +\S+ +\d+ +\S+ +\w+ +\d+ +\w+ +\d+ +(\S+)",
            pool_id
        ))
        .unwrap();

        Arc::new(Self {
            pool_id,
            ports: discovery.ports,
            compute_ports: discovery.compute_ports,
            pair_ports: discovery.pair_ports,
            wwns: discovery.wwns,
            portals: discovery.portals,
            iqns: parking_lot::RwLock::new(HashMap::new()),
            pair_targets,
            copy_groups,
            dp_pool_pattern,
            pool_pattern,
        })
    }

    /// Ports used for pair-dedicated attachments
    pub fn pair_attach_ports(&self) -> &[String] {
        if self.pair_ports.is_empty() {
            &self.ports
        } else {
            &self.pair_ports
        }
    }

    /// Ports offered to a connecting host
    pub fn attach_ports(&self, host: &HostDescriptor, own_ip: &str) -> &[String] {
        if host.ip == own_ip || self.compute_ports.is_empty() {
            &self.ports
        } else {
            &self.compute_ports
        }
    }
}

// =============================================================================
// Protocol Port
// =============================================================================

/// Transport-specific operations behind the reconciler and pair engine
#[async_trait]
pub trait ProtocolOps: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Host identities offered for registration (WWPNs or the IQN)
    fn host_ids(&self, host: &HostDescriptor) -> Result<Vec<String>>;

    /// Harvest usable ports (and WWNs/portals) from the array
    async fn discover_ports(&self) -> Result<PortDiscovery>;

    /// Find the host's groups on each port; returns the number of ports
    /// where nothing was found. Individual misses never raise.
    async fn find_targets(
        &self,
        state: &StorageState,
        host: &HostDescriptor,
        ports: &[String],
        targets: &mut TargetSet,
    ) -> Result<usize>;

    /// Create a host group; `host_ids` seeds the target name where the
    /// transport requires it
    async fn create_target(
        &self,
        port: &str,
        name: &str,
        host_ids: Option<&[String]>,
    ) -> Result<String>;

    /// Apply the transport's host-mode options to a group
    async fn set_target_mode(&self, port: &str, gid: &str) -> Result<()>;

    /// Register the host's identities against a group
    async fn register_host_ids(&self, port: &str, gid: &str, host_ids: &[String]) -> Result<()>;

    /// Assemble the protocol data handed back to the attaching host
    async fn connection_properties(
        &self,
        state: &StorageState,
        targets: &TargetSet,
        lun: u64,
        host: &HostDescriptor,
    ) -> Result<ConnectionProperties>;
}

pub type ProtocolOpsRef = Arc<dyn ProtocolOps>;

// =============================================================================
// Factory
// =============================================================================

/// Selects the protocol implementation from the configuration
pub struct ProtocolFactory;

impl ProtocolFactory {
    pub fn create(shell: Arc<HorcmShell>) -> Result<ProtocolOpsRef> {
        let config = shell.config.clone();
        match (config.dialect, config.protocol) {
            (Dialect::Horcm, Protocol::Fc) => Ok(Arc::new(FcProtocol::new(shell))),
            (Dialect::Horcm, Protocol::Iscsi) => Ok(Arc::new(IscsiProtocol::new(shell))),
            (Dialect::Snm2, _) => Err(Error::InvalidParameter(
                "dialect: the SNM2 command interface is not available in this build".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::runner::ScriptedRunner;
    use crate::lock::LockRegistry;

    fn config(protocol: Protocol, dialect: Dialect) -> DriverConfig {
        DriverConfig {
            serial: "492015".into(),
            pool: "30".into(),
            protocol,
            dialect,
            target_ports: vec!["CL1-A".into()],
            pair_target_ports: vec!["CL1-A".into()],
            user: "user".into(),
            password: "secret".into(),
            ..DriverConfig::default()
        }
    }

    fn shell(config: DriverConfig) -> Arc<HorcmShell> {
        HorcmShell::new(ScriptedRunner::new(), Arc::new(config), LockRegistry::new())
    }

    #[test]
    fn test_factory_selects_by_configuration() {
        let fc = ProtocolFactory::create(shell(config(Protocol::Fc, Dialect::Horcm))).unwrap();
        assert_eq!(fc.protocol(), Protocol::Fc);

        let iscsi =
            ProtocolFactory::create(shell(config(Protocol::Iscsi, Dialect::Horcm))).unwrap();
        assert_eq!(iscsi.protocol(), Protocol::Iscsi);

        assert!(ProtocolFactory::create(shell(config(Protocol::Fc, Dialect::Snm2))).is_err());
    }

    #[test]
    fn test_state_copy_group_names() {
        let config = config(Protocol::Fc, Dialect::Horcm);
        let state = StorageState::new(&config, 30, PortDiscovery::default(), Vec::new());
        assert_eq!(state.copy_groups.len(), MAX_MIRROR_UNITS);
        assert_eq!(state.copy_groups[0], "AMG-127.0.0.14920150C90");
        assert_eq!(state.copy_groups[2], "AMG-127.0.0.14920150C92");
    }

    #[test]
    fn test_state_port_selection() {
        let config = config(Protocol::Fc, Dialect::Horcm);
        let discovery = PortDiscovery {
            ports: vec!["CL1-A".into()],
            compute_ports: vec!["CL3-A".into()],
            pair_ports: vec![],
            ..PortDiscovery::default()
        };
        let state = StorageState::new(&config, 30, discovery, Vec::new());

        // No dedicated pair ports: fall back to the target ports.
        assert_eq!(state.pair_attach_ports(), ["CL1-A".to_string()]);

        let own = HostDescriptor {
            ip: "127.0.0.1".into(),
            ..HostDescriptor::default()
        };
        let other = HostDescriptor {
            ip: "10.0.0.9".into(),
            ..HostDescriptor::default()
        };
        assert_eq!(state.attach_ports(&own, "127.0.0.1"), ["CL1-A".to_string()]);
        assert_eq!(state.attach_ports(&other, "127.0.0.1"), ["CL3-A".to_string()]);
    }

    #[test]
    fn test_discovery_check() {
        let config = config(Protocol::Fc, Dialect::Horcm);
        let empty = PortDiscovery::default();
        assert!(empty.check(&config).is_err());

        let discovery = PortDiscovery {
            ports: vec!["CL1-A".into()],
            pair_ports: vec!["CL1-A".into()],
            ..PortDiscovery::default()
        };
        assert!(discovery.check(&config).is_ok());
    }
}
