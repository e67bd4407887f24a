pub mod analytics;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod routes;
pub mod store;

pub use analytics::{Analytics, AnalyticsEvent, HttpAnalytics, NoopAnalytics};
pub use config::Config;
pub use gateway::{
    HealthCheckProtocol, MetricsAggregator, NodeRegistry, NodeSelector, NodeStatusService,
    PingPongProtocol, ProtocolTable, ReplicaConsistencyJob, RequestCorrelator,
};
pub use store::{BenchmarkRepository, MemoryStore, MetricsStore, NodeStatusStore, SqliteStore};

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::gateway::CapacityLimits;
use crate::store::StoreError;

/// Persistence collaborators.
#[derive(Clone)]
pub struct Stores {
    pub benchmarks: Arc<dyn BenchmarkRepository>,
    pub statuses: Arc<dyn NodeStatusStore>,
    pub metrics: Arc<dyn MetricsStore>,
}

impl Stores {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            benchmarks: store.clone(),
            statuses: store.clone(),
            metrics: store,
        }
    }

    pub fn sqlite(database_url: &str) -> Result<Self, StoreError> {
        let store = Arc::new(SqliteStore::new(database_url)?);
        Ok(Self {
            benchmarks: store.clone(),
            statuses: store.clone(),
            metrics: store,
        })
    }
}

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<NodeRegistry>,
    pub selector: NodeSelector,
    pub correlator: Arc<RequestCorrelator>,
    pub status: Arc<NodeStatusService>,
    pub liveness: Arc<PingPongProtocol>,
    pub health: Arc<HealthCheckProtocol>,
    pub protocols: ProtocolTable,
    pub benchmarks: Arc<dyn BenchmarkRepository>,
    pub analytics: Arc<dyn Analytics>,
}

/// Long-running jobs built alongside the state; started by [`Background::spawn`].
pub struct Background {
    pub metrics: MetricsAggregator,
    pub consistency: ReplicaConsistencyJob,
}

impl Background {
    /// Start the metrics consumer, the consistency job and one timer per
    /// protocol. The handles live for the life of the process.
    pub fn spawn(self, state: &AppState) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.metrics.run()),
            tokio::spawn(self.consistency.run()),
        ];
        handles.extend(state.protocols.spawn_tickers());
        handles
    }
}

impl AppState {
    /// Wire every service once, in dependency order.
    pub fn build(
        config: Config,
        stores: Stores,
        analytics: Arc<dyn Analytics>,
    ) -> (Arc<AppState>, Background) {
        let registry = Arc::new(NodeRegistry::new(config.server.backend_host.clone()));
        let status = Arc::new(NodeStatusService::new(
            stores.statuses.clone(),
            registry.clone(),
        ));

        let (metrics, metrics_sender) = MetricsAggregator::channel(
            stores.metrics.clone(),
            config.metrics.batch_size,
            config.metrics.queue_capacity,
        );

        let selector = NodeSelector::new(registry.clone(), CapacityLimits::from(&config.nodes));
        let correlator = Arc::new(RequestCorrelator::new(
            registry.clone(),
            metrics_sender.clone(),
        ));

        let liveness = Arc::new(PingPongProtocol::new(
            config.ping_pong.clone(),
            registry.clone(),
            status.clone(),
            metrics_sender,
            analytics.clone(),
        ));
        let health = Arc::new(HealthCheckProtocol::new(
            config.health_check.clone(),
            registry.clone(),
            correlator.clone(),
            status.clone(),
        ));

        let mut protocols = ProtocolTable::new();
        protocols.register(liveness.clone());
        protocols.register(health.clone());

        let consistency = ReplicaConsistencyJob::new(
            stores.statuses.clone(),
            registry.clone(),
            status.clone(),
            Duration::from_secs(config.consistency.interval_secs),
        );

        let state = Arc::new(AppState {
            config,
            registry,
            selector,
            correlator,
            status,
            liveness,
            health,
            protocols,
            benchmarks: stores.benchmarks,
            analytics,
        });
        (state, Background { metrics, consistency })
    }
}

/// HTTP and WebSocket routes with the standard layers.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::chat::router(state.clone()))
        .merge(routes::nodes::router(state))
        .layer(axum::middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
