//! # gymvision: credit-metered exercise recognition
//!
//! `gymvision` is the recognition gateway behind the GymVision app. A member photographs a machine
//! or an exercise; the gateway asks an external vision model what it shows, maps the free-form
//! answer onto a fixed catalog of canonical exercise names, and charges one credit against the
//! member's monthly allowance.
//!
//! ## Request Flow
//!
//! `POST /api/recognize-exercise` runs the [`recognition::RecognitionPipeline`]:
//!
//! 1. The image (multipart upload, base64, or URL) is loaded and validated. Bad images are
//!    rejected before any credit is touched.
//! 2. One credit is reserved in the [`quota::QuotaLedger`]. The reservation is the atomic
//!    check-and-decrement, so concurrent requests from several devices can never overspend.
//! 3. The [`classifier::Classifier`] is called under a timeout.
//! 4. Its answer is normalized by the [`catalog::Catalog`].
//! 5. The reservation is committed if the classifier answered, or released if it failed.
//!
//! Each request runs on its own task, so a client that disconnects mid-call cannot leave a
//! reservation unresolved. Reservations orphaned by a crash are released by a background sweeper.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum). Quota accounts live in PostgreSQL
//! (or, for development, in memory). The classifier is any OpenAI-compatible chat completions
//! endpoint with image input.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use gymvision::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = gymvision::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     gymvision::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod auth;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod db;
pub mod errors;
mod metrics;
mod openapi;
pub mod quota;
pub mod recognition;
pub mod telemetry;
mod types;

#[cfg(test)]
pub mod test_utils;

use crate::{
    catalog::Catalog,
    classifier::{Classifier, default_prompt, openai::OpenAIClassifier},
    config::{CorsOrigin, DatabaseConfig, QuotaConfig},
    openapi::ApiDoc,
    quota::{QuotaLedger, QuotaStore, SystemClock, in_memory::InMemoryQuotaStore, postgres::PostgresQuotaStore},
    recognition::{RecognitionPipeline, image::ImageLoader},
};
use anyhow::Context;
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{self, HeaderValue},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument, warn};
use utoipa::OpenApi;

pub use types::{ReservationId, UserId};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .pipeline(pipeline)
///     .catalog(catalog)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub pipeline: RecognitionPipeline,
    pub catalog: Arc<Catalog>,
}

impl AppState {
    /// Wire the recognition pipeline from its collaborators, using `config` for limits and timeouts
    pub fn from_parts(config: Config, ledger: QuotaLedger, classifier: Arc<dyn Classifier>, catalog: Arc<Catalog>) -> anyhow::Result<Self> {
        let images = ImageLoader::new(
            config.recognition.max_image_bytes,
            config.recognition.image_fetch_timeout,
            config.recognition.allow_private_image_hosts,
        )
        .context("Failed to build image fetch client")?;
        let pipeline = RecognitionPipeline::new(ledger, classifier, catalog.clone(), images, config.recognition.classifier_timeout);

        Ok(AppState::builder().config(config).pipeline(pipeline).catalog(catalog).build())
    }
}

/// Get the gymvision database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect to and migrate the configured database. `None` for in-memory storage.
async fn setup_database(config: &Config) -> anyhow::Result<Option<PgPool>> {
    let DatabaseConfig::External { url, pool } = &config.database else {
        warn!("Using in-memory quota storage: balances are lost on restart and not shared between replicas");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(pool.max_connections)
        .min_connections(pool.min_connections)
        .acquire_timeout(Duration::from_secs(pool.acquire_timeout_secs))
        .idle_timeout((pool.idle_timeout_secs > 0).then(|| Duration::from_secs(pool.idle_timeout_secs)))
        .max_lifetime((pool.max_lifetime_secs > 0).then(|| Duration::from_secs(pool.max_lifetime_secs)))
        .connect(url)
        .await
        .context("Failed to connect to database")?;
    migrator().run(&pool).await.context("Failed to run database migrations")?;

    Ok(Some(pool))
}

fn load_catalog(config: &Config) -> anyhow::Result<Catalog> {
    let catalog = match &config.catalog.path {
        Some(path) => Catalog::load(path).with_context(|| format!("Failed to load exercise catalog from {}", path.display()))?,
        None => Catalog::builtin(),
    };
    info!(exercises = catalog.len(), "Exercise catalog loaded");
    Ok(catalog)
}

fn build_classifier(config: &Config, catalog: &Catalog) -> anyhow::Result<OpenAIClassifier> {
    let settings = &config.classifier;
    let api_key = settings
        .api_key
        .clone()
        .context("classifier.api_key is not configured. Set OPENAI_API_KEY.")?;
    let prompt = settings.prompt.clone().unwrap_or_else(|| default_prompt(catalog));
    let client = reqwest::Client::builder().build().context("Failed to build classifier client")?;

    Ok(OpenAIClassifier::new(
        client,
        settings.base_url.clone(),
        api_key,
        settings.model.clone(),
        settings.max_tokens,
        prompt,
    ))
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    // tower-http refuses `*` inside an origin list
    let allow_origin = if config.cors.allowed_origins.contains(&CorsOrigin::Wildcard) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([http::Method::GET, http::Method::POST])
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// - `/api/*` endpoints, with a body limit sized for base64-encoded images
/// - `/healthz` and `/api-docs/openapi.json`
/// - `/internal/metrics` when `enable_metrics` is set
/// - CORS and request tracing
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    // Base64 inflates by 4/3; leave room for the JSON or multipart framing
    let body_limit = state.config.recognition.max_image_bytes.saturating_mul(4) / 3 + 64 * 1024;

    let api_routes = Router::new()
        .route("/recognize-exercise", post(api::handlers::recognition::recognize_exercise))
        .route("/quota", get(api::handlers::quota::get_quota))
        .route("/exercises", get(api::handlers::catalog::list_exercises))
        .route("/exercises/{name}", get(api::handlers::catalog::get_exercise))
        .layer(DefaultBodyLimit::max(body_limit));

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/api", api_routes)
        .with_state(state.clone());

    let mut router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

        // HTTP metrics from axum-prometheus, then recognition and quota metrics
        router = router
            .route(
                "/internal/metrics",
                get(|| async move {
                    use prometheus::{Encoder, TextEncoder};

                    let mut body = metric_handle.render();
                    let mut buffer = vec![];
                    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
                        tracing::error!("Failed to encode metrics: {}", e);
                    }
                    body.push_str(&String::from_utf8_lossy(&buffer));
                    body
                }),
            )
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Background tasks that run alongside the HTTP server.
///
/// Dropping this cancels the shutdown token, which stops every task.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(ledger: QuotaLedger, quota: QuotaConfig, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();

    let sweeper_shutdown = shutdown_token.clone();
    let handle = tokio::spawn(async move {
        run_stale_sweeper(ledger, quota, sweeper_shutdown).await;
    });

    BackgroundServices {
        background_tasks: vec![handle],
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Release reservations orphaned by requests that never finished. Sweeps once immediately, then
/// every `sweep_interval`.
async fn run_stale_sweeper(ledger: QuotaLedger, quota: QuotaConfig, shutdown: CancellationToken) {
    info!(
        interval = ?quota.sweep_interval,
        stale_after = ?quota.stale_reservation_after,
        "Starting stale reservation sweeper"
    );
    let mut interval = tokio::time::interval(quota.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Stale reservation sweeper stopped");
                return;
            }
            _ = interval.tick() => {
                if let Err(e) = ledger.release_stale(quota.stale_reservation_after).await {
                    warn!(error = %e, "Stale reservation sweep failed");
                }
            }
        }
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] loads the catalog, connects and migrates the database,
///    builds the classifier, and starts the stale reservation sweeper
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests
/// 3. **Shutdown**: when the shutdown future resolves, stops background tasks and closes the pool
pub struct Application {
    router: Router,
    config: Config,
    pool: Option<PgPool>,
    pipeline: RecognitionPipeline,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized. `config` is expected to
    /// have passed [`Config::validate`].
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting gymvision with configuration: {:#?}", config);

        let catalog = Arc::new(load_catalog(&config)?);
        let pool = setup_database(&config).await?;

        let store: Arc<dyn QuotaStore> = match &pool {
            Some(pool) => Arc::new(PostgresQuotaStore::new(pool.clone())),
            None => Arc::new(InMemoryQuotaStore::new()),
        };
        let ledger = QuotaLedger::new(store, Arc::new(SystemClock), config.quota.monthly_allowance);
        let classifier = Arc::new(build_classifier(&config, &catalog)?);

        let state = AppState::from_parts(config.clone(), ledger.clone(), classifier, catalog)?;
        let router = build_router(&state)?;

        let bg_services = setup_background_services(ledger, config.quota.clone(), CancellationToken::new());

        Ok(Self {
            router,
            config,
            pool,
            pipeline: state.pipeline,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "GymVision listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Open connections are drained, but recognitions whose client already left may still hold
        // reservations
        info!("Waiting for in-flight recognitions...");
        self.pipeline.wait_for_in_flight().await;
        self.bg_services.shutdown().await;

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        quota::BillingPeriod,
        test_utils::{FixedClock, StubClassifier, create_test_app, create_test_config},
    };
    use uuid::Uuid;

    #[test_log::test(tokio::test)]
    async fn test_healthz_and_openapi() {
        let app = create_test_app(create_test_config(), StubClassifier::answering("squat"));

        let response = app.server.get("/healthz").await;
        response.assert_status_ok();
        assert_eq!(response.text(), "OK");

        let response = app.server.get("/api-docs/openapi.json").await;
        response.assert_status_ok();
        let doc: serde_json::Value = response.json();
        assert!(doc["paths"]["/recognize-exercise"]["post"].is_object());
    }

    #[test_log::test(tokio::test)]
    async fn test_metrics_disabled() {
        let app = create_test_app(create_test_config(), StubClassifier::answering("squat"));

        let response = app.server.get("/internal/metrics").expect_failure().await;
        response.assert_status_not_found();
    }

    // axum-prometheus installs a global recorder, so only one test may enable metrics
    #[test_log::test(tokio::test)]
    async fn test_metrics_enabled() {
        let mut config = create_test_config();
        config.enable_metrics = true;
        let app = create_test_app(config, StubClassifier::answering("squat"));

        app.server.get("/api/exercises").await.assert_status_ok();

        let response = app.server.get("/internal/metrics").await;
        response.assert_status_ok();
        let body = response.text();
        assert!(body.contains("# TYPE"));
    }

    #[test_log::test(tokio::test)]
    async fn test_cors_preflight_from_app_origin() {
        let app = create_test_app(create_test_config(), StubClassifier::answering("squat"));

        let response = app
            .server
            .method(http::Method::OPTIONS, "/api/recognize-exercise")
            .add_header("origin", "capacitor://localhost")
            .add_header("access-control-request-method", "POST")
            .add_header("access-control-request-headers", "content-type")
            .await;

        response.assert_status_ok();
        assert_eq!(response.header("access-control-allow-origin"), "*");
    }

    #[test_log::test(tokio::test)]
    async fn test_cors_with_explicit_origins() {
        let mut config = create_test_config();
        config.cors.allowed_origins = vec![CorsOrigin::Url("https://app.gymvision.ai".parse().unwrap())];
        let app = create_test_app(config, StubClassifier::answering("squat"));

        let response = app
            .server
            .get("/api/exercises")
            .add_header("origin", "https://app.gymvision.ai")
            .await;
        assert_eq!(response.header("access-control-allow-origin"), "https://app.gymvision.ai");

        let response = app
            .server
            .get("/api/exercises")
            .add_header("origin", "https://evil.example.com")
            .await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_application_with_in_memory_storage() {
        let config = create_test_config();

        let app = Application::new(config).await.unwrap();
        let (server, bg_services) = app.into_test_server();

        server.get("/healthz").await.assert_status_ok();
        let response = server
            .get("/api/quota")
            .add_header("x-gymvision-user", Uuid::new_v4().to_string())
            .await;
        response.assert_status_ok();

        bg_services.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_application_rejects_missing_api_key() {
        let mut config = create_test_config();
        config.classifier.api_key = None;

        assert!(Application::new(config).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_application_rejects_unreadable_catalog() {
        let mut config = create_test_config();
        config.catalog.path = Some("/nonexistent/gymvision/catalog.yaml".into());

        assert!(Application::new(config).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_sweeper_refunds_abandoned_reservations() {
        let clock = Arc::new(FixedClock::at_period(2025, 2));
        let store = Arc::new(InMemoryQuotaStore::with_clock(clock.clone()));
        let ledger = QuotaLedger::new(store.clone(), clock.clone(), 10);
        let user = Uuid::new_v4();
        store.insert_account(user, 10, BillingPeriod::new(2025, 2).unwrap());

        // A request that died between reserve and resolve
        let abandoned = ledger.reserve(user, 1).await.unwrap();
        std::mem::drop(abandoned);
        clock.advance(chrono::Duration::minutes(30));

        let quota = QuotaConfig {
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let bg_services = setup_background_services(ledger.clone(), quota, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        bg_services.shutdown().await;

        assert_eq!(ledger.peek(user).await.unwrap().credits_remaining, 10);
    }
}
