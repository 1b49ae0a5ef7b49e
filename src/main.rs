use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_outreach_api::config::Config;
use rust_outreach_api::db::Database;
use rust_outreach_api::generation::{ContentGenerator, OpenAiCompatibleBackend};
use rust_outreach_api::handlers::{self, AppState};
use rust_outreach_api::jobs::JobRunner;
use rust_outreach_api::ledger::DeliveryLedger;
use rust_outreach_api::orchestrator::BatchOrchestrator;
use rust_outreach_api::senders::{ChannelSender, EmailSender, Throttle, WhatsAppSender};
use rust_outreach_api::store::{PgStore, Store};

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - Database connection and migrations.
/// - Generation backend, channel senders and the job runner.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_outreach_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");
    let store: Arc<dyn Store> = Arc::new(PgStore::new(db.pool.clone()));

    let backend = Arc::new(OpenAiCompatibleBackend::new(&config.generation)?);
    let generator = Arc::new(ContentGenerator::new(backend, &config.generation));
    tracing::info!(
        "✓ Generation backend initialized: {} ({})",
        config.generation.base_url,
        config.generation.model
    );

    let senders: Vec<Arc<dyn ChannelSender>> = vec![
        Arc::new(EmailSender::new(&config.delivery)),
        Arc::new(WhatsAppSender::new(&config.delivery)?),
    ];

    let orchestrator = Arc::new(BatchOrchestrator::new(
        store.clone(),
        generator,
        senders,
        Throttle::from(&config.delivery),
        config.delivery.default_phone_region.clone(),
    ));

    let jobs = JobRunner::new(store.clone(), orchestrator.clone());
    let interrupted = jobs.recover_interrupted().await?;
    if interrupted > 0 {
        tracing::warn!("Marked {} interrupted job(s) as failed", interrupted);
    }

    let app_state = Arc::new(AppState {
        config: config.clone(),
        orchestrator,
        jobs,
        ledger: DeliveryLedger::new(store),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = rust_outreach_api::api_routes().layer(
        ServiceBuilder::new()
            // Request size limit: 5MB max payload (lead imports are the largest bodies)
            .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
            // Rate limiting: 10 req/sec per IP, burst of 20
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
