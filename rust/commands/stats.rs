use anyhow::Result;
use tracing::info;

use crate::cli::StatsArgs;

use super::CommandContext;

pub async fn handle(_args: StatsArgs, ctx: &CommandContext) -> Result<()> {
    let stats = ctx.backend.stats().await?;

    println!("Apps:   {}", stats.app_count);
    println!("Keys:   {}", stats.key_count);
    println!("Logins: {}", stats.login_count);

    info!("fetched backend stats");
    Ok(())
}
