use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::provider::ProviderKey;

#[derive(Parser, Debug)]
#[command(
    name = "identify-broker",
    version,
    about = "Identity broker bridging web sign-in providers to Internet Computer delegations"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(
        long,
        help = "Use the Internet Computer mainnet instead of local replica"
    )]
    pub ic: bool,

    #[arg(
        long,
        required = true,
        help = "Principal of the delegation backend canister"
    )]
    pub backend: String,

    #[arg(
        long,
        value_name = "PATH",
        help = "Directory for cached delegations (defaults to the user config dir)"
    )]
    pub data_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Keep session keys in plain files instead of the system keyring"
    )]
    pub file_keys: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Run the signer bridge for relying parties")]
    Serve(ServeArgs),
    #[command(about = "List sign-in providers configured on the backend")]
    Providers(ProvidersArgs),
    #[command(about = "Show backend usage counters")]
    Stats(StatsArgs),
    #[command(about = "Forget the session key and cached delegation for an origin")]
    Reset(ResetArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, default_value_t = 9191, help = "Port for the WebSocket bridge")]
    pub port: u16,

    #[arg(
        long,
        required = true,
        help = "Provider used for sign-in, e.g. google"
    )]
    pub provider: ProviderKey,
}

#[derive(Args, Debug)]
pub struct ProvidersArgs {}

#[derive(Args, Debug)]
pub struct StatsArgs {}

#[derive(Args, Debug)]
pub struct ResetArgs {
    #[arg(
        long,
        required = true,
        help = "Origin of the relying party, e.g. https://app.example"
    )]
    pub origin: String,
}
