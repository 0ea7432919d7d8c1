//! Offsign operator CLI
//!
//! Bring-up and debugging surface for the native signing bridge: write a
//! starter config, probe library resolution, or run a single sign call
//! end-to-end. The HTTP API layer is a separate collaborator; this binary
//! never serves traffic.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use offsign::bridge::{compute_target, LibraryResolver, SignModule};
use offsign::codec::{SignReply, SignRequest};
use offsign::config::OffsignConfig;

#[derive(Parser)]
#[command(name = "offsign")]
#[command(version)]
#[command(about = "Offset-addressed native signing bridge", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "offsign.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter offsign.toml and exit
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Resolve the configured libraries and print base addresses and the
    /// computed target
    Probe,

    /// Load the module, perform one sign call, print the reply, unload
    Sign {
        /// Command selector passed to the native module
        cmd: String,

        /// Hex-encoded payload
        src: String,

        /// Sequence number
        #[arg(default_value = "0")]
        seq: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::InitConfig { force } => init_config(&cli.config, force),
        Commands::Probe => probe(&cli.config),
        Commands::Sign { cmd, src, seq } => sign_once(&cli.config, cmd, src, seq),
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    OffsignConfig::default()
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    println!("Set bridge.libs and bridge.offset before starting the service.");
    Ok(())
}

fn probe(config_path: &Path) -> Result<()> {
    let config = OffsignConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let bridge = config.to_bridge_config().context("invalid configuration")?;

    let resolver = LibraryResolver::new();
    let resolved = resolver
        .resolve_all(&bridge.libs)
        .context("library resolution failed")?;

    for lib in &resolved {
        match lib.region() {
            Some(region) => println!(
                "{}  base {:#x}  mapped {:#x}..{:#x}{}",
                lib.spec(),
                lib.base(),
                region.start,
                region.end,
                if lib.preloaded() { "  (resident)" } else { "" }
            ),
            None => println!(
                "{}  base {:#x}{}",
                lib.spec(),
                lib.base(),
                if lib.preloaded() { "  (resident)" } else { "" }
            ),
        }
    }

    let primary = &resolved[0];
    let target = compute_target(primary.base(), bridge.offset, primary.region())
        .context("target address rejected")?;
    println!(
        "target = {} base {:#x} + offset {:#x} = {:#x}",
        primary.spec(),
        primary.base(),
        bridge.offset,
        target
    );
    Ok(())
}

fn sign_once(config_path: &Path, cmd: String, src: String, seq: u32) -> Result<()> {
    let config = OffsignConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let bridge = config.to_bridge_config().context("invalid configuration")?;

    let request = SignRequest { cmd, src, seq };
    let payload = request.decode_payload().context("invalid request")?;

    let module = SignModule::new(bridge);
    module.load().context("failed to load sign module")?;

    let result = module.sign(&request.cmd, &payload, request.seq);
    module.unload();

    let output = result.context("sign call failed")?;
    let reply = SignReply::from_output(&output);
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
