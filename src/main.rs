//! arraymgr - Array Volume Driver
//!
//! One-shot control binary around the driver library: wires the driver up
//! against the configured array and runs a single volume operation,
//! printing the result as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use arraymgr::{
    CommandRunnerRef, CopyMethod, Dialect, DriverConfig, HostDescriptor, LdevRange, Protocol,
    SystemRunner, VolumeDriver,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume lifecycle driver for CLI-controlled external disk arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Array serial number
    #[arg(long, env = "ARRAY_SERIAL")]
    serial: String,

    /// Storage CLI dialect (horcm)
    #[arg(long, env = "ARRAY_DIALECT", default_value = "horcm")]
    dialect: String,

    /// Transport protocol (fc, iscsi)
    #[arg(long, env = "ARRAY_PROTOCOL", default_value = "fc")]
    protocol: String,

    /// Pool for normal volumes (id or name)
    #[arg(long, env = "ARRAY_POOL")]
    pool: String,

    /// Pool for thin-copy snapshot data
    #[arg(long, env = "ARRAY_THIN_POOL")]
    thin_pool: Option<String>,

    /// LDEV allocation range, e.g. "0-1023" or "00:00:10-00:03:ff"
    #[arg(long, env = "ARRAY_LDEV_RANGE")]
    ldev_range: Option<String>,

    /// Default copy method (FULL, THIN)
    #[arg(long, env = "ARRAY_COPY_METHOD", default_value = "FULL")]
    copy_method: String,

    /// Copy pace (1-15)
    #[arg(long, env = "ARRAY_COPY_SPEED", default_value = "3")]
    copy_speed: u8,

    /// Target port names, comma separated
    #[arg(long, env = "ARRAY_TARGET_PORTS", value_delimiter = ',')]
    target_ports: Vec<String>,

    /// Compute-node target port names, comma separated
    #[arg(long, env = "ARRAY_COMPUTE_TARGET_PORTS", value_delimiter = ',')]
    compute_target_ports: Vec<String>,

    /// Pair-dedicated target port names, comma separated
    #[arg(long, env = "ARRAY_PAIR_TARGET_PORTS", value_delimiter = ',')]
    pair_target_ports: Vec<String>,

    /// Create host groups on demand for connecting hosts
    #[arg(long, env = "ARRAY_GROUP_REQUEST")]
    group_request: bool,

    /// Control-process instance numbers (main, pair)
    #[arg(long, env = "ARRAY_INSTANCES", value_delimiter = ',', num_args = 2,
          default_values = ["200", "201"])]
    instances: Vec<u16>,

    /// Array account for control-process authentication
    #[arg(long, env = "ARRAY_USER")]
    user: String,

    /// Password for control-process authentication
    #[arg(long, env = "ARRAY_PASSWORD", hide_env_values = true)]
    password: String,

    /// Skip writing the control-process configuration files
    #[arg(long, env = "ARRAY_NO_ADD_CONF")]
    no_add_conf: bool,

    /// Resource group scoping this driver's locks
    #[arg(long, env = "ARRAY_RESOURCE_GROUP")]
    resource_group: Option<String>,

    /// Only look up host groups by their well-known name
    #[arg(long, env = "ARRAY_NAME_ONLY_DISCOVERY")]
    name_only_discovery: bool,

    /// Release attachments without an I/O wait
    #[arg(long, env = "ARRAY_DISABLE_IO_WAIT")]
    disable_io_wait: bool,

    /// Enable CHAP authentication on iSCSI targets
    #[arg(long, env = "ARRAY_USE_CHAP")]
    use_chap_auth: bool,

    /// CHAP user
    #[arg(long, env = "ARRAY_CHAP_USER")]
    auth_user: Option<String>,

    /// CHAP password
    #[arg(long, env = "ARRAY_CHAP_PASSWORD", hide_env_values = true)]
    auth_password: Option<String>,

    /// Address identifying this host in group and copy-group names
    #[arg(long, env = "ARRAY_HOST_IP", default_value = "127.0.0.1")]
    host_ip: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a volume
    CreateVolume {
        #[arg(long)]
        size_gb: u64,
    },
    /// Delete a volume
    DeleteVolume {
        #[arg(long)]
        location: String,
    },
    /// Create a snapshot of a volume
    CreateSnapshot {
        #[arg(long)]
        source: String,
        #[arg(long)]
        size_gb: u64,
        /// Copy method override (FULL, THIN)
        #[arg(long)]
        copy_method: Option<String>,
    },
    /// Delete a snapshot
    DeleteSnapshot {
        #[arg(long)]
        location: String,
    },
    /// Create a writable clone of a volume
    CloneVolume {
        #[arg(long)]
        source: String,
        #[arg(long)]
        size_gb: u64,
        #[arg(long)]
        copy_method: Option<String>,
    },
    /// Grow a volume
    ExtendVolume {
        #[arg(long)]
        location: String,
        #[arg(long)]
        size_gb: u64,
    },
    /// Expose a volume to a host
    Attach {
        #[arg(long)]
        location: String,
        #[arg(long)]
        host_ip: String,
        /// FC initiator WWPNs, comma separated
        #[arg(long, value_delimiter = ',')]
        wwpns: Vec<String>,
        /// iSCSI initiator IQN
        #[arg(long)]
        iqn: Option<String>,
        #[arg(long)]
        multipath: bool,
    },
    /// Remove a host's paths to a volume
    Detach {
        #[arg(long)]
        location: String,
        #[arg(long)]
        host_ip: String,
        #[arg(long, value_delimiter = ',')]
        wwpns: Vec<String>,
        #[arg(long)]
        iqn: Option<String>,
        #[arg(long)]
        multipath: bool,
    },
    /// Take over an externally-created device
    Manage {
        /// Device id, decimal or colon-hex
        #[arg(long)]
        source_id: String,
    },
    /// Report the size of an externally-created device
    ManageSize {
        #[arg(long)]
        source_id: String,
    },
    /// Release a volume from management without deleting data
    Unmanage {
        #[arg(long)]
        location: String,
    },
    /// Report pool capacity
    Capacity,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting arraymgr");
    info!("  Version: {}", arraymgr::VERSION);
    info!("  Array: {}", args.serial);
    info!("  Protocol: {}", args.protocol);

    let config = build_config(&args)?;
    let runner: CommandRunnerRef = Arc::new(SystemRunner);
    let driver = VolumeDriver::setup(config, runner)
        .await
        .context("driver setup failed")?;

    let output = run_command(&driver, &args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_command(
    driver: &VolumeDriver,
    command: &Command,
) -> anyhow::Result<serde_json::Value> {
    let value = match command {
        Command::CreateVolume { size_gb } => {
            serde_json::to_value(driver.create_volume(*size_gb).await?)?
        }
        Command::DeleteVolume { location } => {
            driver.delete_volume(Some(location)).await?;
            serde_json::json!({ "deleted": location })
        }
        Command::CreateSnapshot {
            source,
            size_gb,
            copy_method,
        } => {
            let method = parse_copy_method(copy_method.as_deref())?;
            serde_json::to_value(
                driver
                    .create_snapshot(Some(source), *size_gb, method)
                    .await?,
            )?
        }
        Command::DeleteSnapshot { location } => {
            driver.delete_snapshot(Some(location)).await?;
            serde_json::json!({ "deleted": location })
        }
        Command::CloneVolume {
            source,
            size_gb,
            copy_method,
        } => {
            let method = parse_copy_method(copy_method.as_deref())?;
            serde_json::to_value(
                driver
                    .create_cloned_volume(Some(source), *size_gb, method)
                    .await?,
            )?
        }
        Command::ExtendVolume { location, size_gb } => {
            driver.extend_volume(Some(location), *size_gb).await?;
            serde_json::json!({ "extended": location, "size_gb": size_gb })
        }
        Command::Attach {
            location,
            host_ip,
            wwpns,
            iqn,
            multipath,
        } => {
            let host = HostDescriptor {
                ip: host_ip.clone(),
                wwpns: wwpns.clone(),
                iqn: iqn.clone(),
                multipath: *multipath,
            };
            serde_json::to_value(driver.initialize_connection(Some(location), &host).await?)?
        }
        Command::Detach {
            location,
            host_ip,
            wwpns,
            iqn,
            multipath,
        } => {
            let host = HostDescriptor {
                ip: host_ip.clone(),
                wwpns: wwpns.clone(),
                iqn: iqn.clone(),
                multipath: *multipath,
            };
            driver.terminate_connection(Some(location), &host).await?;
            serde_json::json!({ "detached": location })
        }
        Command::Manage { source_id } => {
            serde_json::to_value(driver.manage_existing(source_id).await?)?
        }
        Command::ManageSize { source_id } => {
            let size_gb = driver.manage_existing_get_size(source_id).await?;
            serde_json::json!({ "size_gb": size_gb })
        }
        Command::Unmanage { location } => {
            driver.unmanage(Some(location)).await?;
            serde_json::json!({ "unmanaged": location })
        }
        Command::Capacity => serde_json::to_value(driver.get_capacity().await?)?,
    };
    Ok(value)
}

fn build_config(args: &Args) -> anyhow::Result<DriverConfig> {
    let dialect = match args.dialect.to_lowercase().as_str() {
        "horcm" => Dialect::Horcm,
        "snm2" => Dialect::Snm2,
        other => anyhow::bail!("unknown dialect: {}", other),
    };
    let protocol = match args.protocol.to_lowercase().as_str() {
        "fc" => Protocol::Fc,
        "iscsi" => Protocol::Iscsi,
        other => anyhow::bail!("unknown protocol: {}", other),
    };
    let ldev_range = args
        .ldev_range
        .as_deref()
        .map(LdevRange::parse)
        .transpose()?;
    let default_copy_method = CopyMethod::parse(&args.copy_method.to_uppercase())?;
    if args.instances.len() != 2 {
        anyhow::bail!("exactly two control-process instance numbers are required");
    }

    Ok(DriverConfig {
        serial: args.serial.clone(),
        dialect,
        protocol,
        pool: args.pool.clone(),
        thin_pool: args.thin_pool.clone(),
        ldev_range,
        default_copy_method,
        copy_speed: args.copy_speed,
        target_ports: args.target_ports.clone(),
        compute_target_ports: args.compute_target_ports.clone(),
        pair_target_ports: args.pair_target_ports.clone(),
        group_request: args.group_request,
        instances: [args.instances[0], args.instances[1]],
        user: args.user.clone(),
        password: args.password.clone(),
        add_conf: !args.no_add_conf,
        resource_group: args.resource_group.clone(),
        name_only_discovery: args.name_only_discovery,
        disable_io_wait: args.disable_io_wait,
        use_chap_auth: args.use_chap_auth,
        auth_user: args.auth_user.clone(),
        auth_password: args.auth_password.clone(),
        host_ip: args.host_ip.clone(),
        ..DriverConfig::default()
    })
}

fn parse_copy_method(value: Option<&str>) -> anyhow::Result<Option<CopyMethod>> {
    value
        .map(|v| CopyMethod::parse(&v.to_uppercase()).map_err(Into::into))
        .transpose()
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
