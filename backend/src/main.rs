use axum::{
    extract::{Path, Query, State},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod database;
mod error;
mod events;
mod freshness;
mod jobs;
mod notify;
mod rules;
mod services;
mod sla;
mod store;
mod sync;
mod transports;
mod upstream;

pub use error::{CoreError, CoreResult};

#[cfg(test)]
mod tests;

use events::{ChangeEventConsumer, EventBus, RedisEventBus};
use jobs::{JobIntervals, JobScheduler};
use notify::{
    AuditSink, EmailSink, NotificationQueue, PgQueueJournal, PushSink, SocketSink,
    SourceRateLimiter, StreamSink, WebhookSink,
};
use rules::{ActionExecutor, RulesEngine};
use services::HybridDataService;
use sla::SlaEngine;
use store::{GroupStore, PgGroupStore, PgSlaStore, PgTicketStore, SlaStore, TicketStore};
use sync::SyncEngine;
use transports::{SocketManager, StreamManager};
use upstream::{ServiceNowApi, ServiceNowClient, StaticCredentials};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub socket_manager: Arc<SocketManager>,
    pub stream_manager: Arc<StreamManager>,
    pub hybrid: Arc<HybridDataService>,
    pub sync_engine: Arc<SyncEngine>,
    pub sla_engine: Arc<SlaEngine>,
    pub queue: Arc<NotificationQueue>,
    pub group_store: Arc<dyn GroupStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,snowbridge_backend=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;

    // Store and bus are hard dependencies; failing either is fatal.
    let db_pool = database::create_pool(&config.database_url).await?;
    database::migrate(&db_pool).await?;
    let bus: Arc<dyn EventBus> = Arc::new(RedisEventBus::connect(&config.redis_url).await?);

    let credentials = Arc::new(StaticCredentials::basic(
        &config.upstream.username,
        &config.upstream.password,
    ));
    let upstream: Arc<dyn ServiceNowApi> = Arc::new(ServiceNowClient::new(
        &config.upstream,
        &config.rate_limits,
        credentials,
    )?);

    let ticket_store: Arc<dyn TicketStore> = Arc::new(PgTicketStore::new(db_pool.clone()));
    let sla_store: Arc<dyn SlaStore> = Arc::new(PgSlaStore::new(db_pool.clone()));
    let group_store: Arc<dyn GroupStore> = Arc::new(PgGroupStore::new(db_pool.clone()));

    let hybrid = Arc::new(HybridDataService::new(
        ticket_store.clone(),
        upstream.clone(),
        bus.clone(),
    ));

    let sla_engine = Arc::new(SlaEngine::new(
        sla_store.clone(),
        bus.clone(),
        config.sla.clone(),
    ));
    sla_engine.load_contracts().await?;

    let socket_manager = Arc::new(SocketManager::new(config.transport));
    let stream_manager = Arc::new(StreamManager::new(config.transport));

    let journal = config
        .queue
        .enable_persistence
        .then(|| Arc::new(PgQueueJournal::new(db_pool.clone())) as Arc<dyn notify::QueueJournal>);
    let queue = Arc::new(NotificationQueue::new(
        config.queue.clone(),
        SourceRateLimiter::new(config.rate_limits),
        bus.clone(),
        journal,
    ));
    queue
        .register_sink(Arc::new(SocketSink::new(socket_manager.clone())))
        .await;
    queue
        .register_sink(Arc::new(StreamSink::new(stream_manager.clone())))
        .await;
    queue
        .register_sink(Arc::new(AuditSink::new(db_pool.clone())))
        .await;
    if let Some(url) = &config.webhook_url {
        queue.register_sink(Arc::new(WebhookSink::new(url.clone()))).await;
    }
    if let Some(url) = &config.push_gateway_url {
        queue.register_sink(Arc::new(PushSink::new(url.clone()))).await;
    }
    if let Some(email) = &config.email {
        queue.register_sink(Arc::new(EmailSink::new(email))).await;
    }
    queue.restore().await?;
    queue.start().await;

    let rules_engine = Arc::new(RulesEngine::new(ActionExecutor::new(
        upstream.clone(),
        queue.clone(),
    )));
    if let Ok(path) = std::env::var("BUSINESS_RULES_FILE") {
        rules_engine.reload(rules::load_rules_file(&path)?).await;
    }

    let shutdown = CancellationToken::new();

    // Lifecycle fan-in: hybrid-service events drive the SLA and rules
    // engines; change streams feed the notification queue.
    sla_engine
        .clone()
        .spawn_listener(hybrid.subscribe_lifecycle(), shutdown.clone());
    rules_engine
        .clone()
        .spawn_listener(hybrid.subscribe_lifecycle(), shutdown.clone());
    if config.enable_real_time_updates {
        ChangeEventConsumer::new(bus.clone(), queue.clone(), &config.sync.enabled_tables)
            .spawn(shutdown.clone());
    }
    socket_manager.clone().spawn_heartbeat(shutdown.clone());
    stream_manager.clone().spawn_heartbeat(shutdown.clone());

    let sync_engine = Arc::new(SyncEngine::new(
        upstream.clone(),
        ticket_store.clone(),
        group_store.clone(),
        bus.clone(),
        config.sync.clone(),
    ));
    let scheduler = Arc::new(JobScheduler::new(
        sync_engine.clone(),
        sla_engine.clone(),
        queue.clone(),
        JobIntervals {
            sync_interval_minutes: config.sync.interval_minutes,
            sla_check_interval_minutes: config.sla.check_interval_minutes,
        },
    ));
    scheduler.start().await?;

    // Full sync on startup; later runs are on-demand.
    let startup_sync = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = startup_sync.run_job_now("full_sync").await {
            tracing::error!(error = %e, "startup full sync failed");
        }
    });

    let app_state = Arc::new(AppState {
        db_pool,
        socket_manager,
        stream_manager,
        hybrid,
        sync_engine,
        sla_engine,
        queue,
        group_store,
    });

    let queue_handle = app_state.queue.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "snowbridge v0.1.0" }))
        .route("/health", get(health))
        .route("/api/tickets/:table", axum::routing::post(create_ticket))
        .route("/api/tickets/:table/:sys_id", get(get_ticket).patch(update_ticket))
        .route("/api/groups/:sys_id", get(get_group))
        .route("/api/sla/metrics", get(sla_metrics))
        .route("/ws", get(transports::socket::websocket_handler))
        .route("/events", get(transports::stream::sse_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!(addr = %config.server_addr, "snowbridge listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    // Ordered teardown: stop the scheduler (drains sync), then the queue
    // worker, then the listeners and transports.
    scheduler.stop().await?;
    queue_handle.stop().await;
    shutdown.cancel();
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_healthy = database::health_check(&state.db_pool).await;
    let sync_stats = state.sync_engine.stats().await;

    Json(serde_json::json!({
        "status": if db_healthy { "ok" } else { "degraded" },
        "store": {
            "healthy": db_healthy,
            "pool": database::get_pool_stats(&state.db_pool),
        },
        "sync": sync_stats,
        "queue": {
            "depth": state.queue.depth(),
            "dead_letters": state.queue.dead_letter_count().await,
        },
        "transports": {
            "socket_clients": state.socket_manager.connection_count().await,
            "stream_clients": state.stream_manager.connection_count().await,
        },
    }))
}

#[derive(serde::Deserialize, Default)]
struct GetTicketQuery {
    #[serde(default)]
    force_upstream: bool,
    #[serde(default)]
    include_slas: bool,
}

async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path((table, sys_id)): Path<(String, String)>,
    Query(query): Query<GetTicketQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let table = table
        .parse::<snowbridge_shared::TicketTable>()
        .map_err(|e| CoreError::validation("table", e))?;

    let ticket = state
        .hybrid
        .get_ticket(
            &sys_id,
            table,
            services::GetTicketOptions {
                force_upstream: query.force_upstream,
                include_slas: query.include_slas,
            },
        )
        .await?
        .ok_or_else(|| CoreError::not_found(format!("{} {}", table, sys_id)))?;

    Ok(Json(ticket))
}

async fn update_ticket(
    State(state): State<Arc<AppState>>,
    Path((table, sys_id)): Path<(String, String)>,
    Json(changes): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<impl IntoResponse, CoreError> {
    let table = table
        .parse::<snowbridge_shared::TicketTable>()
        .map_err(|e| CoreError::validation("table", e))?;

    let ticket = state.hybrid.update_ticket(&sys_id, table, changes).await?;
    Ok(Json(ticket))
}

async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<impl IntoResponse, CoreError> {
    let table = table
        .parse::<snowbridge_shared::TicketTable>()
        .map_err(|e| CoreError::validation("table", e))?;

    let ticket = state.hybrid.create_ticket(table, payload).await?;
    Ok(Json(ticket))
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(sys_id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    let group = state
        .group_store
        .get(&sys_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("assignment group {}", sys_id)))?;
    Ok(Json(group))
}

async fn sla_metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, CoreError> {
    let report = state.sla_engine.metrics().await?;
    Ok(Json(report))
}
