use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "amctl",
    about = "Access Manager: blob gateway over replicated object and catalog services",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Gateway configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a write workload against an in-process cluster and verify it
    Demo(DemoArgs),
    /// Print the placement tables an in-process cluster would use
    Topology(TopologyArgs),
    /// Show or check gateway configuration
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ClusterArgs {
    /// Backend nodes, each hosting an SM and a DM
    #[arg(long, default_value_t = 4)]
    pub nodes: u64,
    /// Replicas per placement group
    #[arg(long, default_value_t = 3)]
    pub replicas: usize,
    /// DLT width in bits (2^bits columns)
    #[arg(long, default_value_t = 2)]
    pub dlt_bits: u32,
}

#[derive(Args, Clone, Debug)]
pub struct DemoArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    /// Concurrent writers; each owns one blob
    #[arg(long, default_value_t = 4)]
    pub writers: usize,
    /// Writes per writer
    #[arg(long, default_value_t = 32)]
    pub writes: usize,
    /// Largest single write in bytes
    #[arg(long, default_value_t = 3000)]
    pub max_write: usize,
    /// Object size override for the demo volume
    #[arg(long)]
    pub object_size: Option<u32>,
    /// Seed for the workload generator
    #[arg(long, default_value_t = 7)]
    pub seed: u64,
    /// Install new DLT and DMT versions while writes are in flight
    #[arg(long)]
    pub rebalance: bool,
    /// Take one node down once the writers are running; it stays down
    #[arg(long)]
    pub fail_node: Option<u64>,
}

#[derive(Args, Clone, Debug)]
pub struct TopologyArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate a configuration file
    Check {
        path: PathBuf,
    },
}
