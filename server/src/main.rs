use std::net::SocketAddr;

use color_eyre::eyre::WrapErr;
use jobbsoker_server::{routes, AppConfig, AppState};
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};
use tracing_tree::HierarchicalLayer;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Initialize Sentry for error tracking
    let _sentry_guard = setup_sentry();

    // Create and run the tokio runtime
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

fn setup_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: std::env::var("APP_ENV").ok().map(Into::into),
            traces_sample_rate: 0.1,
            ..Default::default()
        },
    )))
}

fn setup_tracing() -> color_eyre::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,jobbsoker_server=debug,tower_http=debug"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .with(sentry::integrations::tracing::layer())
        .try_init()?;

    Ok(())
}

async fn run_application() -> color_eyre::Result<()> {
    // Initialize tracing
    setup_tracing()?;

    // Refuse to start on incomplete production config
    let config = AppConfig::from_env().wrap_err("Invalid configuration, refusing to start")?;
    info!(environment = ?config.environment, "Configuration loaded");
    config.vipps.policy.log_active();

    let port = config.port;
    let app_state = AppState::from_config(config).await?;

    let app = routes::routes(app_state).layer(
        ServiceBuilder::new()
            .layer(sentry_tower::NewSentryLayer::<axum::extract::Request>::new_from_top())
            .layer(sentry_tower::SentryHttpLayer::with_transaction()),
    );

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .await
        .wrap_err("Failed to bind listen address")?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
