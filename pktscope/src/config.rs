use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::format::MAX_LINE_LEN;
use crate::record::Stage;
use crate::store::DEFAULT_CAPACITY;

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface to attach the TC classifiers on.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Port serving the read endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log capacity in bytes.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Observe packets before the routing decision (TC ingress).
    #[serde(default = "default_true")]
    pub pre_routing: bool,

    /// Observe packets after the routing decision (TC egress).
    #[serde(default = "default_true")]
    pub post_routing: bool,

    /// Netlink priority for both classifiers. 1 runs first.
    #[serde(default = "default_priority")]
    pub priority: u16,

    /// Compiled classifier object produced by `cargo xtask build-ebpf`.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: PathBuf,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to read the endpoints (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u16 {
    1
}

fn default_ebpf_object() -> PathBuf {
    PathBuf::from("pktscope-ebpf/target/bpfel-unknown-none/release/pktscope")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_port(),
            log_capacity: default_log_capacity(),
            pre_routing: true,
            post_routing: true,
            priority: default_priority(),
            ebpf_object: default_ebpf_object(),
            quiet: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ref interface) = cli.interface {
            self.interface = interface.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(capacity) = cli.log_capacity {
            self.log_capacity = capacity;
        }
        if cli.no_pre_routing {
            self.pre_routing = false;
        }
        if cli.no_post_routing {
            self.post_routing = false;
        }
        if let Some(priority) = cli.priority {
            self.priority = priority;
        }
        if let Some(ref object) = cli.ebpf_object {
            self.ebpf_object = object.clone();
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.log_capacity >= MAX_LINE_LEN,
            "log_capacity must be at least {} bytes, got {}",
            MAX_LINE_LEN,
            self.log_capacity
        );
        anyhow::ensure!(
            self.pre_routing || self.post_routing,
            "at least one of pre_routing / post_routing must be enabled"
        );
        for cidr in &self.allowed_ips {
            cidr.parse::<ipnet::IpNet>()
                .map_err(|e| anyhow::anyhow!("invalid allowed_ips entry {:?}: {}", cidr, e))?;
        }
        Ok(())
    }

    /// Stages to register, each with the configured priority.
    pub fn stages(&self) -> Vec<(Stage, u16)> {
        Stage::ALL
            .into_iter()
            .filter(|stage| match stage {
                Stage::PreRouting => self.pre_routing,
                Stage::PostRouting => self.post_routing,
            })
            .map(|stage| (stage, self.priority))
            .collect()
    }
}

use clap::Parser;

/// pktscope: TCP/UDP header logger on TC ingress/egress
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to attach the classifiers to (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Port to serve the read endpoints on.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log capacity in bytes.
    #[arg(long)]
    pub log_capacity: Option<usize>,

    /// Do not observe packets before routing (TC ingress).
    #[arg(long)]
    pub no_pre_routing: bool,

    /// Do not observe packets after routing (TC egress).
    #[arg(long)]
    pub no_post_routing: bool,

    /// Netlink priority for the classifiers.
    #[arg(long)]
    pub priority: Option<u16>,

    /// Path to the compiled eBPF object.
    #[arg(long)]
    pub ebpf_object: Option<PathBuf>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to read the endpoints (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
