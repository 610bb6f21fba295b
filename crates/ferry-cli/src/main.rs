//! Ferry CLI
//!
//! Sends files to one or many recipients over simulated parallel-channel
//! links, exercising the full handshake, ratchet and transport stack.

mod config;
mod progress;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use ferry_core::loopback::{LoopbackConnector, PeerBehavior};
use ferry_core::{
    Connector, FileSource, GroupStatus, ReceivedData, RecipientDescriptor, RecipientId,
    TransferEngine,
};
use ferry_crypto::identity::IdentityKeypair;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use config::Config;
use progress::{GroupProgress, format_bytes, format_duration, format_speed};

/// Ferry - forward-secure multi-recipient file transfer
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to one recipient
    Send {
        /// File to send
        file: PathBuf,

        /// Recipient id
        recipient: String,

        /// Directory the simulated recipient writes into
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send a file to several recipients in parallel
    Group {
        /// File to send
        file: PathBuf,

        /// Recipient ids
        #[arg(required = true)]
        recipients: Vec<String>,

        /// Recipients whose link is cut mid-transfer
        #[arg(long = "fail", value_name = "ID")]
        failing: Vec<String>,

        /// Frames a failing recipient receives before its link is cut
        #[arg(long, default_value_t = 8)]
        fail_after: u64,

        /// Recipients that decline the invite
        #[arg(long = "decline", value_name = "ID")]
        declining: Vec<String>,

        /// Directory the simulated recipients write into, one subdirectory each
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a new identity keypair
    Keygen {
        /// Output file for the identity seed
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to the configuration path
        #[arg(long)]
        write: bool,
    },
}

struct Plan {
    file: PathBuf,
    recipients: Vec<String>,
    failing: Vec<String>,
    fail_after: u64,
    declining: Vec<String>,
    output: Option<PathBuf>,
    single: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::load_or_default(&config_path)?
    };
    config.validate()?;
    init_logging(cli.verbose, &config.logging.level);

    match cli.command {
        Commands::Send {
            file,
            recipient,
            output,
        } => {
            run_transfer(
                &config,
                Plan {
                    file,
                    recipients: vec![recipient],
                    failing: Vec::new(),
                    fail_after: 0,
                    declining: Vec::new(),
                    output,
                    single: true,
                },
            )
            .await?;
        }
        Commands::Group {
            file,
            recipients,
            failing,
            fail_after,
            declining,
            output,
        } => {
            run_transfer(
                &config,
                Plan {
                    file,
                    recipients,
                    failing,
                    fail_after,
                    declining,
                    output,
                    single: false,
                },
            )
            .await?;
        }
        Commands::Keygen { output } => generate_identity(output)?,
        Commands::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                config.save(&config_path)?;
                println!("\nSaved to {}", config_path.display());
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: u8, configured: &str) {
    let level = match verbose {
        0 => configured.to_lowercase(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_transfer(config: &Config, plan: Plan) -> anyhow::Result<()> {
    let source = FileSource::open(&plan.file)
        .await
        .with_context(|| format!("opening {}", plan.file.display()))?;
    let identity = config
        .identity
        .key_file
        .as_deref()
        .map(load_identity)
        .transpose()?
        .map(Arc::new);

    let engine_config = Arc::new(config.engine.clone());
    let connector = Arc::new(LoopbackConnector::new(
        Arc::clone(&engine_config),
        config.simulation.profile()?,
    ));

    let mut recipients = Vec::with_capacity(plan.recipients.len());
    for id in &plan.recipients {
        let descriptor =
            RecipientDescriptor::new(id.as_str(), id.as_str(), format!("loopback://{id}"));
        let mut behavior = if plan.declining.contains(id) {
            PeerBehavior::declining("declined from the command line")
        } else if plan.failing.contains(id) {
            PeerBehavior::failing_after(plan.fail_after)
        } else {
            PeerBehavior::accepting()
        };
        if let Some(identity) = &identity {
            behavior = behavior.expecting_sender(identity.public_key());
        }
        if let Some(dir) = &plan.output {
            let target = if plan.single {
                dir.clone()
            } else {
                dir.join(id)
            };
            std::fs::create_dir_all(&target)?;
            behavior = behavior.into_directory(target);
        }
        connector.add_peer(&descriptor.id, behavior);
        recipients.push(descriptor);
    }

    let shared: Arc<dyn Connector> = Arc::clone(&connector) as Arc<dyn Connector>;
    let mut engine = TransferEngine::new(config.engine.clone(), shared)?
        .with_sender_name(config.identity.display_name.clone());
    if let Some(identity) = &identity {
        engine = engine.with_identity(Arc::clone(identity));
    }

    println!("File: {} ({})", plan.file.display(), format_bytes(source.len()));
    println!(
        "Recipients: {} over {} x {} channels",
        recipients.len(),
        config.simulation.link,
        config.engine.transport.channel_count
    );

    let ids: Vec<RecipientId> = recipients.iter().map(|r| r.id.clone()).collect();
    let file_size = source.len();
    let handle = if plan.single {
        let recipient = recipients.pop().context("send needs a recipient")?;
        engine.create_single_transfer(recipient, source).await?
    } else {
        engine.create_group_transfer(recipients, source).await?
    };

    let bars = GroupProgress::new(file_size, &ids);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let wait = handle.wait();
    tokio::pin!(wait);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupted = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            _ = ticker.tick() => bars.refresh(&handle),
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                tracing::warn!("interrupted, cancelling transfer");
                handle.cancel();
            }
        }
    };
    bars.refresh(&handle);
    bars.finish(&outcome);

    println!();
    let throughput = if outcome.elapsed.is_zero() {
        0.0
    } else {
        (file_size * outcome.succeeded.len() as u64) as f64 / outcome.elapsed.as_secs_f64()
    };
    println!(
        "{} in {} ({} aggregate)",
        match outcome.status {
            GroupStatus::Completed => style(outcome.status.to_string()).green(),
            GroupStatus::Partial => style(outcome.status.to_string()).yellow(),
            _ => style(outcome.status.to_string()).red(),
        },
        format_duration(outcome.elapsed),
        format_speed(throughput)
    );
    for id in &outcome.succeeded {
        if let Some(Ok(file)) = connector.received(id).await {
            let location = match &file.data {
                ReceivedData::Memory(bytes) => {
                    format!("{} in memory", format_bytes(bytes.len() as u64))
                }
                ReceivedData::Disk(path) => path.display().to_string(),
            };
            println!("  {id}: {} ({location}) blake3 {}", file.name, hex::encode(&file.hash[..8]));
        }
    }
    for failure in &outcome.failed {
        println!("  {}: {}", failure.recipient, style(&failure.error).red());
    }

    if outcome.status == GroupStatus::Failed {
        anyhow::bail!("no recipient received the file");
    }
    Ok(())
}

fn load_identity(path: &Path) -> anyhow::Result<IdentityKeypair> {
    let contents = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("reading identity {}", path.display()))?,
    );
    let bytes = Zeroizing::new(hex::decode(contents.trim())?);
    let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity seed must be 32 bytes"))?,
    );
    Ok(IdentityKeypair::from_seed(&seed))
}

fn generate_identity(output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Generating new Ed25519 identity...");
    let seed = Zeroizing::new(ferry_crypto::random::random_32()?);
    let identity = IdentityKeypair::from_seed(&seed);
    let public = identity.public_key();

    println!("Public key:  {}", hex::encode(public.to_bytes()));
    println!("Fingerprint: {}", public.fingerprint());

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let encoded = Zeroizing::new(hex::encode(*seed));
            write_private(&path, encoded.as_bytes())?;
            println!("Seed saved to: {}", path.display());
            println!("Set identity.key_file in the config to use it.");
        }
        None => println!("Seed not saved (use --output to save)"),
    }
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}
