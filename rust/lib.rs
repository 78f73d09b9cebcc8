pub mod backend;
pub mod candid_decode;
pub mod channel;
pub mod cli;
mod commands;
pub mod delegation;
pub mod issuer;
pub mod provider;
pub mod serve;
pub mod session;
pub mod signer;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use candid::Principal;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;

use crate::{
    backend::{AgentBackend, create_anonymous_agent},
    cli::Cli,
    commands::{CommandContext, run_command},
    delegation::DelegationStore,
    issuer::DelegationIssuer,
    provider::SystemBrowserProvider,
    session::SessionKeyStore,
    store::{FsStore, KeyValueStore, KeyringStore},
};

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let max = match cli.global.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    fmt().with_max_level(max).without_time().try_init().ok();

    let data_dir = match &cli.global.data_dir {
        Some(dir) => dir.clone(),
        None => FsStore::default_dir()?,
    };
    let file_store: Arc<dyn KeyValueStore> = Arc::new(FsStore::new(&data_dir));
    let key_store: Arc<dyn KeyValueStore> = if cli.global.file_keys {
        file_store.clone()
    } else {
        Arc::new(KeyringStore)
    };

    let backend_id = Principal::from_text(&cli.global.backend)
        .context("Invalid backend canister principal")?;
    let agent = create_anonymous_agent(cli.global.ic).await?;
    let backend = Arc::new(AgentBackend::new(agent, backend_id));
    let issuer = Arc::new(DelegationIssuer::new(
        backend.clone(),
        Arc::new(SystemBrowserProvider),
        SessionKeyStore::new(key_store),
        DelegationStore::new(file_store),
    ));

    let context = CommandContext {
        backend,
        issuer,
        ic: cli.global.ic,
    };

    run_command(cli.command, context).await
}
