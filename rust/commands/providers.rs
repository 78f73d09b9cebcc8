use anyhow::Result;
use tracing::info;

use crate::{cli::ProvidersArgs, provider::AuthConfig};

use super::CommandContext;

pub async fn handle(_args: ProvidersArgs, ctx: &CommandContext) -> Result<()> {
    let providers = ctx.backend.providers().await?;

    if providers.is_empty() {
        println!("No providers configured.");
    } else {
        println!("Providers:");
        for (key, config) in &providers {
            let flow = match config {
                AuthConfig::Oidc(_) => "OIDC",
                AuthConfig::Pkce(_) => "PKCE",
            };
            println!("- {key}: {} ({flow})", config.name());
        }
    }

    info!("listed providers");
    Ok(())
}
