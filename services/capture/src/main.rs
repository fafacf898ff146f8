use anyhow::{Context, Result};
use nestcam_capture::{
    CaptureManager, Collaborators, Config, Dispatcher, FfmpegEncoder, HttpNotifier, MqttBus,
    MySqlMetadataStore, Notifier,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        "Starting Nestcam Capture Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    tokio::fs::create_dir_all(&config.capture.storage_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage directory {}",
                config.capture.storage_dir.display()
            )
        })?;

    // Initialize components
    let store = Arc::new(
        MySqlMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let encoder = Arc::new(FfmpegEncoder::new(
        config.capture.ffmpeg_path.clone(),
        config.capture.ffmpeg_quality,
    ));

    let notifier = match &config.notifications {
        Some(notifications) => {
            let notifier = HttpNotifier::new(notifications)
                .context("Failed to initialize notification client")?;
            Some(Arc::new(notifier) as Arc<dyn Notifier>)
        }
        None => {
            info!("Push notifications disabled");
            None
        }
    };

    let (bus, publisher) = MqttBus::new(&config.mqtt);

    let manager = Arc::new(CaptureManager::new(
        &config.capture,
        Collaborators {
            directory: store.clone(),
            store: store.clone(),
            encoder,
            publisher: Arc::new(publisher),
            notifier,
        },
    ));

    let (tx, rx) = mpsc::channel(config.mqtt.channel_capacity);

    let dispatcher = Dispatcher::new(
        manager,
        config.mqtt.topic_namespace.clone(),
        config.capture.sweep_interval(),
    );

    // Spawn dispatcher task
    let dispatcher_handle = tokio::spawn(dispatcher.run(rx));

    // Spawn MQTT event loop task
    let bus_handle = tokio::spawn(async move {
        if let Err(e) = bus.run(tx).await {
            error!(error = %e, "MQTT event loop stopped");
        }
    });

    info!(
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        storage_dir = %config.capture.storage_dir.display(),
        "Capture service started successfully"
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down capture service");

    // In-flight sessions are abandoned
    bus_handle.abort();
    dispatcher_handle.abort();

    info!("Capture service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
