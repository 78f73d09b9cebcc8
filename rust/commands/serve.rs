use anyhow::Result;
use tracing::info;

use crate::{
    cli::ServeArgs,
    serve::{ServeOptions, serve},
};

use super::CommandContext;

pub async fn handle(args: ServeArgs, ctx: &CommandContext) -> Result<()> {
    info!(provider = %args.provider, "starting signer bridge");
    serve(
        ctx.issuer.clone(),
        ServeOptions {
            port: args.port,
            provider: args.provider,
            ic: ctx.ic,
        },
    )
    .await
}
