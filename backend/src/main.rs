use std::net::SocketAddr;

use tokio::net::TcpListener;

use fleet_broker::{analytics, app, logging, AppState, Config, Stores};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    logging::init(&config.logging.level);

    tracing::info!(
        backend_host = %config.server.backend_host,
        "Starting Fleet Broker"
    );

    // Initialize components
    let stores = Stores::sqlite(&config.database.url)?;
    let analytics = analytics::from_url(config.analytics.url.as_deref());
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let (state, background) = AppState::build(config, stores, analytics);
    let _jobs = background.spawn(&state);

    // Start server
    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
