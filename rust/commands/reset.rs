use anyhow::Result;
use tracing::info;

use crate::cli::ResetArgs;

use super::CommandContext;

pub async fn handle(args: ResetArgs, ctx: &CommandContext) -> Result<()> {
    ctx.issuer.delegations().reset(&args.origin).await?;
    ctx.issuer.sessions().reset(&args.origin).await?;

    println!("Forgot session key and delegation for {}", args.origin);

    info!(origin = %args.origin, "reset origin");
    Ok(())
}
