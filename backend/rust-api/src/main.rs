use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use examsync_api::{config::Config, create_router, services::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // OpenTelemetry tracer (spans are dropped if no collector listens)
    let _tracer = init_telemetry()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "examsync_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer())
        .init();

    tracing::info!("Starting ExamSync attempt API");

    let config = Config::load()?;
    tracing::info!(
        "Configuration loaded for environment: {:?}",
        std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string())
    );

    let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri).await?;
    tracing::info!("MongoDB client created");

    let redis_client = redis::Client::open(config.redis_uri.clone())?;

    let bind_addr = config.bind_addr.clone();
    let app_state = Arc::new(AppState::new(config, mongo_client, redis_client).await?);
    let sweeper = app_state.spawn_background_tasks();

    let app = create_router(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    let flushed = app_state.attempts.batcher().flush_all().await;
    tracing::info!(flushed, "Pending auto-save batches flushed");

    shutdown_telemetry();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, draining requests");
}

fn init_telemetry() -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use opentelemetry_sdk::Resource;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint)
        .build()?;

    let resource = Resource::builder_empty()
        .with_service_name("examsync-api")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("examsync-api");
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracer)
}

fn shutdown_telemetry() {
    tracing::info!("Shutting down OpenTelemetry");
    // opentelemetry 0.31 flushes when the provider is dropped
}
