use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpResponse, HttpServer};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use ecoreport::config::{validate_env, AppConfig};
use ecoreport::openapi::ApiDoc;
use ecoreport::rate_limit::{RateLimitConfig, RateLimiter};
use ecoreport::repo::PostRepo;
use ecoreport::storage::build_image_store;
use ecoreport::{config, AppState, ChangeFeed};

async fn metrics_endpoint(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env automatically only in debug builds; deployments set the environment externally.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    let problems = validate_env();
    if !problems.is_empty() {
        for p in &problems {
            eprintln!("{p}");
        }
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = AppConfig::from_env();
    info!("Bootstrapping ecoreport gateway");
    info!(frontend = %cfg.frontend_url, threshold = cfg.approval.threshold, "configuration loaded");

    let feed = ChangeFeed::default();

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo: Arc<dyn PostRepo> = {
        info!("Using in-memory repository backend");
        Arc::new(ecoreport::repo::inmem::InMemRepo::new(feed.clone()))
    };

    #[cfg(feature = "postgres-store")]
    let repo: Arc<dyn PostRepo> = {
        use sqlx::postgres::PgPoolOptions;
        let db_url = std::env::var("DATABASE_URL").map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "DATABASE_URL must be set for postgres-store")
        })?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        sqlx::migrate!().run(&pool).await.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        info!("Using Postgres repository backend");
        Arc::new(ecoreport::repo::pg::PgRepo::new(pool, feed.clone()))
    };

    let image_store = build_image_store().await.map_err(|e| {
        error!(error = %e, "image store initialisation failed");
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let state = AppState {
        approval: cfg.approval,
        public_base_url: cfg.public_base_url.clone(),
        rate_limiter: Some(RateLimiter::new(RateLimitConfig::from_env())),
        sse_keepalive: cfg.sse_keepalive,
        ..AppState::new(repo, image_store, feed)
    };

    let frontend_url = cfg.frontend_url.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_url)
            // local dev servers
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allow_any_header()
            .allowed_methods(["GET", "POST", "PUT", "OPTIONS"])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(prometheus.clone()))
            .configure(config)
            .route("/metrics", web::get().to(metrics_endpoint))
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind((cfg.bind_addr.as_str(), cfg.port))?;

    info!("Listening on http://{}:{}", cfg.bind_addr, cfg.port);

    server.run().await
}
