use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conversa_core::audit::AuditLogger;
use conversa_core::circuit_breaker::create_delivery_circuit_breaker;
use conversa_core::config::Config;
use conversa_core::conversation::ConversationStore;
use conversa_core::db::Database;
use conversa_core::dispatch::{DeliveryClient, DispatchGateway};
use conversa_core::handlers::{self, AppState};
use conversa_core::identity::IdentityResolver;
use conversa_core::intake;
use conversa_core::realtime::{self, RealtimePublisher};
use conversa_core::responsibility::ResponsibilityEngine;

/// Main entry point for the application.
///
/// Initializes tracing, configuration, the database pool, caches, the
/// delivery client with its circuit breaker, and the HTTP routes with
/// rate limiting and CORS. Also spawns the background reconciliation
/// sweep for outbound messages stuck in pending.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conversa_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    // Dedup cache for repeated intake webhook deliveries (5 minute TTL)
    let recent_event_cache = Cache::builder()
        .time_to_live(Duration::from_secs(300))
        .max_capacity(10_000)
        .build();
    tracing::info!("Intake deduplication cache initialized");

    // Per-company responsibles projection cache (1 hour TTL, refreshed on resync)
    let responsibles_cache = Cache::builder()
        .time_to_live(Duration::from_secs(3600))
        .max_capacity(10_000)
        .build();
    tracing::info!("Responsibles cache initialized");

    let audit = AuditLogger::new(db.pool.clone());
    let resolver = IdentityResolver::new(db.pool.clone());
    let store = ConversationStore::new(db.pool.clone());
    let engine = ResponsibilityEngine::new(
        db.pool.clone(),
        audit.clone(),
        responsibles_cache,
        config.agent_display_name.clone(),
    );

    let delivery = DeliveryClient::new(
        config.delivery_webhook_url.clone(),
        config.delivery_token.clone(),
        Duration::from_secs(config.dispatch_timeout_secs),
    )?;
    tracing::info!("Delivery client initialized: {}", config.delivery_webhook_url);

    let gateway = DispatchGateway::new(
        db.pool.clone(),
        store.clone(),
        delivery,
        create_delivery_circuit_breaker(),
        audit.clone(),
        config.dispatch_max_retries,
    );

    let realtime = RealtimePublisher::new(256);

    // Build application state
    let app_state = Arc::new(AppState {
        db: db.pool.clone(),
        config: config.clone(),
        resolver,
        store,
        engine,
        gateway: gateway.clone(),
        audit,
        realtime,
        recent_event_cache,
    });

    // Background reconciliation: settle outbound messages whose delivery
    // outcome is unknown (provider timed out). Runs every minute; the
    // cutoff is twice the per-attempt timeout so in-flight sends are
    // never swept.
    let sweep_gateway = gateway.clone();
    let sweep_cutoff = chrono::Duration::seconds(config.dispatch_timeout_secs as i64 * 2);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_gateway.reconcile_pending(sweep_cutoff).await {
                tracing::error!("Reconciliation sweep failed: {}", e);
            }
        }
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Inbound webhooks
        .route("/api/v1/intake", post(intake::intake_webhook))
        .route(
            "/api/v1/webhooks/delivery-status",
            post(handlers::delivery_status),
        )
        // Conversations and messages
        .route(
            "/api/v1/conversations/:id/messages",
            get(handlers::list_messages).post(handlers::send_message),
        )
        // Leads and responsibility routing
        .route(
            "/api/v1/leads/:id/toggle",
            post(handlers::toggle_responsibility),
        )
        .route("/api/v1/leads/:id/transfer", post(handlers::transfer_lead))
        .route(
            "/api/v1/leads/:id/qualification",
            patch(handlers::update_qualification),
        )
        .route("/api/v1/leads/:id", delete(handlers::delete_lead))
        // Responsibles projection
        .route("/api/v1/responsibles", get(handlers::list_responsibles))
        .route(
            "/api/v1/responsibles/resync",
            post(handlers::resync_responsibles),
        )
        // Audit trail
        .route("/api/v1/audit", get(handlers::query_audit))
        // Operator trigger for the reconciliation sweep
        .route(
            "/api/v1/dispatch/reconcile",
            post(handlers::reconcile_dispatches),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 5MB max payload
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check and WebSocket bypass rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/realtime", get(realtime::ws_handler))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
