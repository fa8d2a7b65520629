mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ethid_chain::sim::SimChain;
use ethid_chain::ChainClient;
use ethid_core::{
    ContractManager, ContractRegistry, IdentityStore, ManagerConfig, ManagerRegistry,
    MemoryIdentityStore,
};

use settings::{IdentityTypeSettings, Settings};

#[derive(Parser)]
#[command(name = "ethid")]
#[command(about = "EthID contract lifecycle operator", long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = "ethid.toml")]
    config: PathBuf,

    /// Run against the in-process simulated chain instead of a live node.
    #[arg(long)]
    dev: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach every configured identity type and reconcile contract events
    /// until interrupted.
    Start,

    /// Compile each configured contract and print the code hash that a
    /// deployment would record.
    Status,
}

fn chain_client(settings: &Settings, dev: bool) -> Result<Arc<dyn ChainClient>> {
    if dev {
        return Ok(Arc::new(SimChain::new()));
    }
    bail!(
        "no live node backend is built in yet; re-run with --dev \
         (configured endpoint was {})",
        settings.node_uri
    );
}

fn read_contract_source(identity_type: &IdentityTypeSettings) -> Result<String> {
    std::fs::read_to_string(&identity_type.contract_source).with_context(|| {
        format!(
            "reading contract source for '{}' from {}",
            identity_type.name,
            identity_type.contract_source.display()
        )
    })
}

async fn start(settings: Settings, dev: bool) -> Result<()> {
    if settings.identity_types.is_empty() {
        bail!("no identity types configured; nothing to attach");
    }
    let chain = chain_client(&settings, dev)?;
    let contract_registry = Arc::new(ContractRegistry::new());
    let store = Arc::new(MemoryIdentityStore::new()) as Arc<dyn IdentityStore>;
    let managers = ManagerRegistry::new();

    for identity_type in &settings.identity_types {
        let source = read_contract_source(identity_type)?;
        let manager = ContractManager::new(
            ManagerConfig {
                identity_type: identity_type.name.clone(),
                claim_format: identity_type.claim_format,
                contract_source: source,
                gas_limit: settings.gas_limit,
                resume_from: None,
            },
            Arc::clone(&chain),
            Arc::clone(&contract_registry),
            Arc::clone(&store),
        );
        managers.register(Arc::clone(&manager))?;

        // A failed attachment is fatal for its identity type but the others
        // still come up; the operator resolves it and restarts.
        match manager.start().await {
            Ok(()) => info!(identity_type = %identity_type.name, "attached"),
            Err(err) => warn!(
                identity_type = %identity_type.name,
                error = %err,
                "attachment failed, identity type left detached"
            ),
        }
    }

    info!(
        identity_types = ?managers.identity_types(),
        "ethid running, press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;

    for name in managers.identity_types() {
        if let Some(manager) = managers.get(&name) {
            manager.shutdown();
        }
    }
    info!("shut down");
    Ok(())
}

async fn status(settings: Settings, dev: bool) -> Result<()> {
    if settings.identity_types.is_empty() {
        println!("no identity types configured");
        return Ok(());
    }
    let chain = chain_client(&settings, dev)?;
    for identity_type in &settings.identity_types {
        let source = read_contract_source(identity_type)?;
        match chain.compile(&source).await {
            Ok(compiled) => println!(
                "{}: claim format {}, code hash 0x{}",
                identity_type.name,
                identity_type.claim_format,
                hex::encode(compiled.code_hash())
            ),
            Err(err) => println!("{}: compile failed: {err}", identity_type.name),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Start => start(settings, cli.dev).await,
        Commands::Status => status(settings, cli.dev).await,
    }
}
