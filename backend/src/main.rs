use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod automations;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod services;

pub use error::{ApiError, ApiResult, AppError};

#[cfg(test)]
mod tests;

use automations::{
    AutomationService, AutomationStore, EnrollmentScheduler, ExecutionLog, PgAutomationStore, RetryCoordinator,
    StepExecutor, TriggerEvaluator,
};
use services::{
    ContactStore, EmailTransport, HttpWebhookClient, PgContactStore, SmtpEmailTransport, WebhookClient,
    WebhookSigner,
};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub automations: AutomationService,
    pub triggers: Arc<TriggerEvaluator>,
    pub jobs: Option<Arc<jobs::JobScheduler>>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Cadence Automation API v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", handlers::api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "cadence_backend=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    if !config.smtp.is_configured() {
        tracing::warn!("SMTP credentials are not set; email steps will fail to deliver");
    }

    let store: Arc<dyn AutomationStore> = Arc::new(PgAutomationStore::new(db_pool.clone()));
    let contacts: Arc<dyn ContactStore> = Arc::new(PgContactStore::new(db_pool.clone()));
    let email: Arc<dyn EmailTransport> = Arc::new(SmtpEmailTransport::new(&config.smtp, db_pool.clone())?);
    let webhooks: Arc<dyn WebhookClient> = Arc::new(HttpWebhookClient::new(config.engine.network_timeout())?);

    let log = ExecutionLog::new(store.clone());
    let retry = RetryCoordinator::new(config.engine.retry_policy(), config.engine.network_timeout(), log.clone());
    let executor = StepExecutor::new(
        contacts.clone(),
        email,
        webhooks,
        WebhookSigner::new(config.engine.webhook_signing_secret.clone()),
        retry,
    );
    let scheduler = EnrollmentScheduler::new(store.clone(), contacts, executor, config.engine.scheduler_config());
    let _workers = scheduler.start().await?;

    let job_scheduler = jobs::JobScheduler::new(
        scheduler.clone(),
        log,
        jobs::JobConfig {
            poll_interval_secs: config.engine.poll_interval_secs,
            log_retention_days: config.engine.log_retention_days,
            ..jobs::JobConfig::default()
        },
    )
    .await?;
    job_scheduler.start().await?;

    let app_state = Arc::new(AppState {
        db_pool,
        automations: AutomationService::new(store.clone(), scheduler.clone()),
        triggers: Arc::new(TriggerEvaluator::new(store, scheduler)),
        jobs: Some(Arc::new(job_scheduler)),
    });

    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
