//! Driver configuration
//!
//! Configuration for the array volume driver: array identity, pools, LDEV
//! range, copy behavior, target ports and the control-process instances.
//! Validation mirrors what the array will reject later, so misconfiguration
//! fails at startup rather than mid-operation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Enums
// =============================================================================

/// Control dialect of the storage command line interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// HORCM-style control process (`raidcom`/`pair*` commands)
    Horcm,
    /// SNM2-style direct CLI (not shipped; see DESIGN.md)
    Snm2,
}

/// Transport protocol towards the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Fc,
    Iscsi,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Fc => write!(f, "FC"),
            Protocol::Iscsi => write!(f, "iSCSI"),
        }
    }
}

/// Replication copy method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CopyMethod {
    Full,
    Thin,
}

impl CopyMethod {
    /// Parse the metadata form ("FULL" / "THIN")
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "FULL" => Ok(CopyMethod::Full),
            "THIN" => Ok(CopyMethod::Thin),
            other => Err(Error::InvalidMetadata(format!("copy_method: {}", other))),
        }
    }
}

impl std::fmt::Display for CopyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyMethod::Full => write!(f, "Full copy"),
            CopyMethod::Thin => write!(f, "Thin copy"),
        }
    }
}

// =============================================================================
// LDEV identifiers
// =============================================================================

/// Parse an LDEV identifier in decimal or colon-separated hex form
/// ("1025" or "00:04:01"). Returns `None` for anything else.
pub fn parse_ldev_id(value: &str) -> Option<u32> {
    if value.is_empty() {
        return None;
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse().ok();
    }
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 || !parts.iter().all(|p| p.len() == 2) {
        return None;
    }
    u32::from_str_radix(&value.replace(':', ""), 16).ok()
}

/// Inclusive LDEV id range the driver is allowed to allocate from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdevRange {
    pub begin: u32,
    pub end: u32,
}

impl LdevRange {
    /// Parse a "begin-end" range; each bound may be decimal or colon-hex
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidParameter(format!("ldev_range: {}", value));
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() != 2 {
            return Err(invalid());
        }
        let begin = parse_ldev_id(parts[0].trim()).ok_or_else(invalid)?;
        let end = parse_ldev_id(parts[1].trim()).ok_or_else(invalid)?;
        if begin > end {
            return Err(invalid());
        }
        Ok(LdevRange { begin, end })
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

/// Index of the main control-process instance
pub const INSTANCE_MAIN: usize = 0;
/// Index of the pair-operation control-process instance
pub const INSTANCE_PAIR: usize = 1;

/// Configuration for the array volume driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Array serial number
    pub serial: String,
    /// Control dialect
    pub dialect: Dialect,
    /// Transport protocol
    pub protocol: Protocol,
    /// Pool for normal volumes (id or name)
    pub pool: String,
    /// Pool for thin-copy snapshot data
    pub thin_pool: Option<String>,
    /// Restrict LDEV allocation to this range
    pub ldev_range: Option<LdevRange>,
    /// Copy method used when a request does not specify one
    pub default_copy_method: CopyMethod,
    /// Copy pace passed to the array (1..=15)
    pub copy_speed: u8,
    /// Poll interval for synchronous copy status checks
    pub copy_check_interval: Duration,
    /// Poll interval for asynchronous copy status checks
    pub async_copy_check_interval: Duration,
    /// Target port names for host attachments
    pub target_ports: Vec<String>,
    /// Target port names reserved for compute-node attachments
    pub compute_target_ports: Vec<String>,
    /// Target port names for pair-dedicated attachments
    pub pair_target_ports: Vec<String>,
    /// Create host groups on demand for connecting hosts
    pub group_request: bool,
    /// Control-process instance numbers [main, pair]
    pub instances: [u16; 2],
    /// Array account for control-process authentication
    pub user: String,
    /// Password for control-process authentication
    pub password: String,
    /// Write the control-process configuration files during setup
    pub add_conf: bool,
    /// Resource group scoping the driver's locks on a shared array
    pub resource_group: Option<String>,
    /// Only look up host groups by their well-known name during discovery
    pub name_only_discovery: bool,
    /// Set the host-mode option that releases attachments without an I/O wait
    pub disable_io_wait: bool,
    /// Enable CHAP authentication on iSCSI targets
    pub use_chap_auth: bool,
    /// CHAP user
    pub auth_user: Option<String>,
    /// CHAP password
    pub auth_password: Option<String>,
    /// Address identifying this host in group and copy-group names
    pub host_ip: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            dialect: Dialect::Horcm,
            protocol: Protocol::Fc,
            pool: String::new(),
            thin_pool: None,
            ldev_range: None,
            default_copy_method: CopyMethod::Full,
            copy_speed: 3,
            copy_check_interval: Duration::from_secs(3),
            async_copy_check_interval: Duration::from_secs(10),
            target_ports: Vec::new(),
            compute_target_ports: Vec::new(),
            pair_target_ports: Vec::new(),
            group_request: false,
            instances: [200, 201],
            user: String::new(),
            password: String::new(),
            add_conf: true,
            resource_group: None,
            name_only_discovery: false,
            disable_io_wait: false,
            use_chap_auth: false,
            auth_user: None,
            auth_password: None,
            host_ip: "127.0.0.1".to_string(),
        }
    }
}

impl DriverConfig {
    /// Validate the configuration before any array command is issued
    pub fn validate(&self) -> Result<()> {
        if self.serial.is_empty() {
            return Err(Error::InvalidParameter("serial".into()));
        }
        if self.pool.is_empty() {
            return Err(Error::InvalidParameter("pool".into()));
        }
        if self.default_copy_method == CopyMethod::Thin && self.thin_pool.is_none() {
            return Err(Error::InvalidParameter("thin_pool".into()));
        }
        if !(1..=15).contains(&self.copy_speed) {
            return Err(Error::InvalidParameter("copy_speed".into()));
        }
        if self.instances[INSTANCE_MAIN] == self.instances[INSTANCE_PAIR] {
            return Err(Error::InvalidParameter("instances".into()));
        }
        if self.target_ports.is_empty() && self.compute_target_ports.is_empty() {
            return Err(Error::InvalidParameter("target_ports".into()));
        }
        if self.target_ports.is_empty() && self.pair_target_ports.is_empty() {
            return Err(Error::InvalidParameter("pair_target_ports".into()));
        }
        if self.protocol == Protocol::Iscsi && self.use_chap_auth {
            if self.auth_user.is_none() {
                return Err(Error::InvalidParameter("auth_user".into()));
            }
            if self.auth_password.is_none() {
                return Err(Error::InvalidParameter("auth_password".into()));
            }
        }
        Ok(())
    }

    /// Suffix appended to lock names so two driver instances managing
    /// disjoint resource groups of one array do not serialize
    pub fn lock_scope(&self) -> String {
        match &self.resource_group {
            Some(group) => format!("{}_{}", self.serial, group),
            None => self.serial.clone(),
        }
    }
}
