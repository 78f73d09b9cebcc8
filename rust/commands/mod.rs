use std::sync::Arc;

use anyhow::Result;

use crate::{backend::Backend, cli::Command, issuer::DelegationIssuer};

pub mod providers;
pub mod reset;
pub mod serve;
pub mod stats;

#[derive(Clone)]
pub struct CommandContext {
    pub backend: Arc<dyn Backend>,
    pub issuer: Arc<DelegationIssuer>,
    pub ic: bool,
}

pub async fn run_command(command: Command, ctx: CommandContext) -> Result<()> {
    match command {
        Command::Serve(args) => serve::handle(args, &ctx).await,
        Command::Providers(args) => providers::handle(args, &ctx).await,
        Command::Stats(args) => stats::handle(args, &ctx).await,
        Command::Reset(args) => reset::handle(args, &ctx).await,
    }
}
