use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod provider;

/// Common CLI arguments for all fixture servers
#[derive(Parser, Debug, Clone)]
pub struct FixtureArgs {
    /// The port to listen on
    #[arg(short, long, default_value = "3100")]
    pub port: u16,

    /// The host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Public base URL of the fixture, used as issuer and in endpoint URLs
    #[arg(long)]
    pub base_url: Option<String>,
}

/// Common function to run a fixture server.
///
/// `app` receives the base URL the fixture is reachable on.
pub async fn run_server(
    args: FixtureArgs,
    app: impl FnOnce(String) -> Router,
) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let addr = format!("{}:{}", args.host, args.port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let base_url = args
        .base_url
        .unwrap_or_else(|| format!("http://{}", local_addr));
    let app = app(base_url.clone()).layer(TraceLayer::new_for_http());

    info!("Fixture server listening on {} as {}", local_addr, base_url);
    axum::serve(listener, app).await?;

    Ok(())
}
