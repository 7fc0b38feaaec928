use clap::Parser;
use fixtures::{
    provider::{router, ProviderState, CLIENT_ID, CLIENT_SECRET},
    run_server, FixtureArgs,
};
use tracing::info;

/// Vipps Login fixture server
#[derive(Parser, Debug)]
#[clap(name = "vipps-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    run_server(args.common, |base_url| {
        info!(
            "Point VIPPS_DISCOVERY_URL at {}/.well-known/openid-configuration and use client {} / {}",
            base_url, CLIENT_ID, CLIENT_SECRET
        );
        router(ProviderState::new(base_url))
    })
    .await
}
