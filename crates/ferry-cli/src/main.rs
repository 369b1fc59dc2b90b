//! FERRY CLI
//!
//! Managed file transfer between trusted hosts

mod config;
mod progress;

use clap::{Parser, Subcommand};
use ferry_core::{
    Engine, JsonFileStore, TransferHandle, TransferKey, TransferOutcome, TransferRequest,
    UpdatedInfo,
};
use ferry_transport::RetrieveMode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::Config;
use progress::{TransferProgress, format_bytes, format_elapsed};

/// How long running transfers get to wind down on Ctrl+C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// FERRY - resumable, rate-limited file transfer
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept transfers from partners
    Serve {
        /// Listen address, overriding the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Send a file to a partner
    Send {
        /// File to send, relative to the out directory unless absolute
        #[arg(required = true)]
        file: String,

        /// Partner name or address
        #[arg(required = true)]
        partner: String,

        /// Rule to apply
        #[arg(short, long, default_value = ferry_core::DEFAULT_RULE)]
        rule: String,

        /// Block size in bytes
        #[arg(long)]
        block_size: Option<u32>,
    },

    /// Fetch a file from a partner
    Get {
        /// Name of the file on the partner
        #[arg(required = true)]
        file: String,

        /// Partner name or address
        #[arg(required = true)]
        partner: String,

        /// Rule to apply
        #[arg(short, long, default_value = ferry_core::DEFAULT_RULE)]
        rule: String,
    },

    /// List transfer records
    List {
        /// Only records in this state (e.g. INERROR, DONE)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Restart a failed or interrupted transfer this host requested
    Resubmit {
        /// Partner the transfer was addressed to
        #[arg(required = true)]
        partner: String,

        /// Special id of the transfer
        #[arg(required = true)]
        id: u64,
    },

    /// Mark transfers left running by a stopped process as interrupted
    Recover,

    /// Print the effective configuration
    Config {
        /// Write the defaults to the configuration path
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_default()?
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Serve { bind } => serve(bind, &config).await?,
        Commands::Send {
            file,
            partner,
            rule,
            block_size,
        } => {
            let mut request = TransferRequest::send(partner, file).with_rule(rule);
            if let Some(block_size) = block_size {
                request = request.with_block_size(block_size);
            }
            run_transfer(request, &config).await?;
        }
        Commands::Get {
            file,
            partner,
            rule,
        } => {
            let request = TransferRequest::receive(partner, file).with_rule(rule);
            run_transfer(request, &config).await?;
        }
        Commands::List { status } => list_transfers(status, &config).await?,
        Commands::Resubmit { partner, id } => resubmit(partner, id, &config).await?,
        Commands::Recover => recover(&config).await?,
        Commands::Config { init } => show_config(init, &config_path, &config)?,
    }

    Ok(())
}

async fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let engine_config = config.to_engine_config()?;
    let store = JsonFileStore::open(&config.node.state_dir).await?;

    let mut builder = Engine::builder(engine_config).store(Arc::new(store));
    for rule in &config.rules {
        builder = builder.rule(rule);
    }
    Ok(builder.build()?)
}

/// Accept inbound transfers until Ctrl+C
async fn serve(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let mut config = config.clone();
    if let Some(bind) = bind {
        config.network.listen_addr = bind;
    }
    let engine = build_engine(&config).await?;

    println!("FERRY node {}", engine.host_id());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", engine.config().listen_addr);
    println!("Inbound: {}", engine.config().in_dir.display());
    println!("Outbound: {}", engine.config().out_dir.display());
    println!("Press Ctrl+C to stop");

    let server = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.listen().await })
    };

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    engine.shutdown(SHUTDOWN_GRACE).await;
    server.await??;
    Ok(())
}

/// Submit, run and follow one transfer
async fn run_transfer(request: TransferRequest, config: &Config) -> anyhow::Result<()> {
    let engine = build_engine(config).await?;
    let record = engine.submit(request).await?;

    let total = match record.retrieve_mode {
        RetrieveMode::Push => Some(std::fs::metadata(&record.filename)?.len()),
        RetrieveMode::Pull => None,
    };
    println!("Transfer: {}", record.key);
    println!("File: {}", record.filename);
    if let Some(total) = total {
        println!("Size: {}", format_bytes(total));
    }
    println!("Partner: {}", record.key.requested);

    let handle = engine.run(&record.key).await?;
    let progress = TransferProgress::new(total, record.block_size, &record.original_name);
    let outcome = follow(&engine, &handle, &progress).await;
    report(outcome, &progress)
}

/// Restart a resubmittable transfer and follow it
async fn resubmit(partner: String, id: u64, config: &Config) -> anyhow::Result<()> {
    let engine = build_engine(config).await?;
    let host = engine.host_id().to_string();
    let key = TransferKey::new(host.clone(), host, partner, id);

    let record = engine.resubmit(&key).await?;
    println!("Resuming {} at block {}", record.key, record.rank);

    let handle = engine.run(&key).await?;
    let progress = TransferProgress::new(None, record.block_size, &record.original_name);
    let outcome = follow(&engine, &handle, &progress).await;
    report(outcome, &progress)
}

/// Release transfers a crashed process left running so they can be resubmitted
async fn recover(config: &Config) -> anyhow::Result<()> {
    let engine = build_engine(config).await?;
    let recovered = engine.recover().await?;
    if recovered.is_empty() {
        println!("No abandoned transfers");
        return Ok(());
    }
    for record in &recovered {
        println!(
            "{} is now {} at block {}",
            record.key, record.updated_info, record.rank
        );
    }
    Ok(())
}

/// Refresh the progress display from the stored rank until the outcome is known
async fn follow(
    engine: &Engine,
    handle: &TransferHandle,
    progress: &TransferProgress,
) -> TransferOutcome {
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            outcome = handle.wait() => {
                handle.wait_closed().await;
                return outcome;
            }
            _ = ticker.tick() => {
                if let Ok(Some(record)) = engine.get(handle.key()).await {
                    progress.update_rank(record.rank);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupting {}", handle.key());
                handle.interrupt();
            }
        }
    }
}

fn report(outcome: TransferOutcome, progress: &TransferProgress) -> anyhow::Result<()> {
    match outcome {
        Ok(success) => {
            progress.finish(format!(
                "Transfer complete: {} blocks",
                success.record.rank
            ));
            if let Some(checksum) = success.checksum {
                println!("BLAKE3: {checksum}");
            }
            Ok(())
        }
        Err(failure) => {
            progress.abandon(format!("Transfer failed: {}", failure.error));
            if let Some(record) = &failure.record {
                println!(
                    "State: {} ({:?}) at block {}",
                    record.updated_info, record.info_status, record.rank
                );
                if record.updated_info.is_resubmittable() {
                    println!(
                        "Resume with: ferry resubmit {} {}",
                        record.key.requested, record.key.special_id
                    );
                }
            }
            Err(failure.into())
        }
    }
}

async fn list_transfers(status: Option<String>, config: &Config) -> anyhow::Result<()> {
    let filter = status.as_deref().map(parse_status).transpose()?;
    let store = JsonFileStore::open(&config.node.state_dir).await?;
    let mut records = ferry_core::TransferStore::list(&store, filter).await?;
    records.sort_by(|a, b| a.key.cmp(&b.key));

    if records.is_empty() {
        println!("No transfers");
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:<12} {:<12} {:>8} {:>8}  FILE",
        "ID", "REQUESTER", "REQUESTED", "STATE", "BLOCKS", "TIME"
    );
    for record in records {
        println!(
            "{:<10} {:<12} {:<12} {:<12} {:>8} {:>8}  {}",
            record.key.special_id,
            record.key.requester,
            record.key.requested,
            record.updated_info.to_string(),
            record.rank,
            format_elapsed(record.start_trans, record.stop_trans),
            record.filename
        );
    }
    Ok(())
}

fn parse_status(value: &str) -> anyhow::Result<UpdatedInfo> {
    let all = [
        UpdatedInfo::Unknown,
        UpdatedInfo::NotUpdated,
        UpdatedInfo::Interrupted,
        UpdatedInfo::ToSubmit,
        UpdatedInfo::InError,
        UpdatedInfo::Running,
        UpdatedInfo::Done,
    ];
    all.into_iter()
        .find(|state| state.to_string().eq_ignore_ascii_case(value.trim()))
        .ok_or_else(|| anyhow::anyhow!("Unknown transfer state: {value}"))
}

fn show_config(init: bool, path: &Path, config: &Config) -> anyhow::Result<()> {
    if init {
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        Config::default().save(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("INERROR").unwrap(), UpdatedInfo::InError);
        assert_eq!(parse_status("done").unwrap(), UpdatedInfo::Done);
        assert!(parse_status("finished").is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from(["ferry", "send", "report.csv", "beta", "--block-size", "4096"])
            .unwrap();
        match cli.command {
            Commands::Send {
                file,
                partner,
                rule,
                block_size,
            } => {
                assert_eq!(file, "report.csv");
                assert_eq!(partner, "beta");
                assert_eq!(rule, ferry_core::DEFAULT_RULE);
                assert_eq!(block_size, Some(4096));
            }
            _ => panic!("expected send"),
        }
    }
}
