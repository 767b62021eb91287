use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the TC classifiers for bpfel-unknown-none.
    BuildEbpf {
        #[arg(long)]
        release: bool,
    },
    /// Build the classifiers, then the userspace agent.
    Build {
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run the agent with sudo, pointed at the freshly
    /// built classifier object.
    Run {
        #[arg(long)]
        release: bool,
        /// Interface to attach the classifiers to.
        #[arg(short, long)]
        interface: Option<String>,
        /// Extra arguments passed to the agent.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_agent(release)
        }
        Cli::Run {
            release,
            interface,
            args,
        } => {
            build_ebpf(release)?;
            build_agent(release)?;
            run(release, interface.as_deref(), &args)
        }
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

/// Where `build-ebpf` leaves the object holding both classifiers.
fn ebpf_object(root: &Path, release: bool) -> PathBuf {
    root.join("pktscope-ebpf/target")
        .join(EBPF_TARGET)
        .join(profile(release))
        .join("pktscope")
}

fn cargo_build(dir: &Path, extra: &[&str], release: bool, what: &str) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(dir).args(extra);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .with_context(|| format!("failed to run cargo build for {what}"))?;
    anyhow::ensure!(status.success(), "{what} build failed");
    Ok(())
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    cargo_build(
        &workspace_root().join("pktscope-ebpf"),
        &[
            "+nightly",
            "build",
            "--target",
            EBPF_TARGET,
            "-Z",
            "build-std=core",
        ],
        release,
        "the TC classifiers",
    )
}

fn build_agent(release: bool) -> anyhow::Result<()> {
    cargo_build(
        &workspace_root(),
        &["build", "--package", "pktscope"],
        release,
        "the agent",
    )
}

fn agent_command(
    root: &Path,
    release: bool,
    interface: Option<&str>,
    extra_args: &[String],
) -> Command {
    let mut cmd = Command::new("sudo");
    cmd.current_dir(root)
        .arg(root.join("target").join(profile(release)).join("pktscope"))
        .arg("--ebpf-object")
        .arg(ebpf_object(root, release));
    if let Some(iface) = interface {
        cmd.args(["--interface", iface]);
    }
    cmd.args(extra_args);
    cmd
}

fn run(release: bool, interface: Option<&str>, extra_args: &[String]) -> anyhow::Result<()> {
    let root = workspace_root();
    let object = ebpf_object(&root, release);
    anyhow::ensure!(
        object.exists(),
        "classifier object {} not found, run `cargo xtask build-ebpf` first",
        object.display()
    );

    let status = agent_command(&root, release, interface, extra_args)
        .status()
        .context("failed to run pktscope")?;
    anyhow::ensure!(status.success(), "pktscope exited with error");
    Ok(())
}
