//! NSM storage server - Main entry point.
//!
//! Starts the Actix-web server with configured routes, middleware and the
//! background queue consumers.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};
use actix_web::{App, HttpServer, web};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use nsm_storage_lib::api;
use nsm_storage_lib::config::{Config, FILE_SIZE_HEADER, FOLDER_ID_HEADER, SseMode, UPLOAD_ID_HEADER};
use nsm_storage_lib::db::{DbPool, PgProgressStore};
use nsm_storage_lib::middleware;
use nsm_storage_lib::models::{FileEvent, FolderEvent};
use nsm_storage_lib::services::queue::in_process_queues;
use nsm_storage_lib::services::{
    self, BlobStore, CleanupConfig, EventStreams, FileRepository, FileService,
    LifecycleEventHandler, MemoryQueue, MessageQueue, ProgressEventHandler, ProgressStore,
    QueueConsumer, QueueName, S3BlobStore, SqsQueue, SubscriberRegistry, UploadPipeline,
};

fn cors(is_development: bool) -> Cors {
    let cors = if is_development {
        // Permissive CORS for development
        Cors::default()
            .allowed_origin("http://localhost:3000")
            .allowed_origin("http://127.0.0.1:3000")
    } else {
        // Restrictive CORS for production (same-origin only)
        Cors::default()
    };

    cors.allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::CACHE_CONTROL,
            HeaderName::from_static(UPLOAD_ID_HEADER),
            HeaderName::from_static(FOLDER_ID_HEADER),
            HeaderName::from_static(FILE_SIZE_HEADER),
        ])
        .max_age(3600)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("");
            error!("Please check your environment variables:");
            error!("  - RUST_ENV must be set to 'development' or 'production'");
            error!("  - In production, DATABASE_URL and S3 credentials must be set");
            error!("  - In production, values must not match development defaults");
            std::process::exit(1);
        }
    };

    info!("========================================");
    info!("  NSM Storage Server");
    info!("  Environment: {}", config.environment);
    info!("========================================");

    if config.is_development() {
        warn!("Running in DEVELOPMENT mode - do not use in production!");
    }

    // Initialize database
    let pool = DbPool::new(&config.database)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    info!("Database connection established");

    pool.run_migrations()
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    info!("Database migrations complete");

    // Storage and messaging backends
    let blobs: Arc<dyn BlobStore> = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?,
    );
    info!("Object storage ready (bucket: {})", config.s3.bucket);

    let queue: Arc<dyn MessageQueue> = if config.sqs.is_enabled() {
        info!("Using SQS for upload and lifecycle events");
        Arc::new(SqsQueue::new(&config.sqs).await)
    } else {
        warn!("No SQS queue configured, events stay inside this process");
        Arc::new(MemoryQueue::with_queues(in_process_queues(&config.sse)))
    };

    let progress: Arc<dyn ProgressStore> =
        Arc::new(PgProgressStore::new(pool.clone(), config.upload.progress_ttl));
    let files: Arc<dyn FileRepository> = Arc::new(pool.clone());
    let registry = SubscriberRegistry::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Queue consumers
    if config.sse.mode == SseMode::Queue && !config.sse.progress_consumer_enabled {
        warn!("SSE queue mode without a progress consumer: streams only send heartbeats");
    }
    if config.sse.progress_consumer_enabled && queue.is_configured(QueueName::ProgressEvents) {
        QueueConsumer::new(
            Arc::clone(&queue),
            QueueName::ProgressEvents,
            ProgressEventHandler::new(registry.clone()),
        )
        .spawn(shutdown_rx.clone());
    }
    if queue.is_configured(QueueName::FileEvents) {
        QueueConsumer::new(
            Arc::clone(&queue),
            QueueName::FileEvents,
            LifecycleEventHandler::<FileEvent>::new(),
        )
        .spawn(shutdown_rx.clone());
    }
    if queue.is_configured(QueueName::FolderEvents) {
        QueueConsumer::new(
            Arc::clone(&queue),
            QueueName::FolderEvents,
            LifecycleEventHandler::<FolderEvent>::new(),
        )
        .spawn(shutdown_rx.clone());
    }

    // Start the cleanup background task
    services::start_cleanup_task(
        Arc::clone(&progress),
        CleanupConfig {
            interval_secs: config.cleanup_interval_secs,
        },
        shutdown_rx.clone(),
    );

    // Prepare shared state
    let pipeline = UploadPipeline::new(
        Arc::clone(&progress),
        Arc::clone(&queue),
        Arc::clone(&blobs),
        Arc::clone(&files),
        config.upload.clone(),
    );
    let streams = EventStreams::new(registry, Arc::clone(&progress), config.sse.clone());
    let file_service = FileService::new(files, blobs, queue);

    let bind_address = config.bind_address();
    let is_development = config.is_development();
    info!(
        "Upload limits: {}MB max size, progress every {}ms, SSE mode {:?}",
        config.upload.max_upload_size / 1024 / 1024,
        config.upload.progress_throttle.as_millis(),
        config.sse.mode
    );

    let worker_count = if is_development {
        info!(
            "Starting server at http://{} (4 workers - development mode)",
            bind_address
        );
        4
    } else {
        let cpus = num_cpus::get();
        info!(
            "Starting server at http://{} ({} workers)",
            bind_address, cpus
        );
        cpus
    };

    // Start HTTP server
    let server = HttpServer::new(move || {
        App::new()
            // Add CORS middleware (must be before other middleware)
            .wrap(cors(is_development))
            // Add request logging middleware
            .wrap(middleware::RequestLogger)
            // Add shared state
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::new(pipeline.clone()))
            .app_data(web::Data::new(streams.clone()))
            .app_data(web::Data::new(file_service.clone()))
            // Configure API routes
            .service(
                web::scope("/api/v1")
                    .configure(api::configure_health_routes)
                    .configure(api::configure_upload_routes)
                    .configure(api::configure_event_routes)
                    .configure(api::configure_file_routes),
            )
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", api::ApiDoc::openapi()),
            )
    })
    .workers(worker_count)
    .bind(&bind_address)?
    .run();

    let result = server.await;

    info!("HTTP server stopped, stopping background tasks");
    let _ = shutdown_tx.send(true);

    result
}
