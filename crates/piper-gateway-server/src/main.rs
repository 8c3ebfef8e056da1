use clap::Parser;
use piper_gateway_server::server::{
    config::{CliArgs, ServerConfig},
    routes::create_router,
    service::orchestrator::SynthesisService,
    synthesis::runner::{ProcessRunner, TokioProcessRunner},
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(config.log_format)?;

    let service = SynthesisService::new(Arc::new(config.synthesis.clone()), TokioProcessRunner);
    if let Err(e) = service.prepare().await {
        tracing::warn!(error = %e, "Output directory is not usable yet");
    }

    let listener = TcpListener::bind(&config.listen_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, create_router(service.clone()))
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;

    tracing::info!("Service shut down successfully");
    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    let synthesis = &config.synthesis;
    tracing::info!("Server running on {}", config.listen_addr);
    tracing::info!("Output directory: {}", synthesis.output_dir.display());
    tracing::info!("Piper executable: {}", synthesis.piper_bin.display());
    tracing::info!("Environment: {}", config.environment);

    if !synthesis.piper_bin.is_file() {
        tracing::warn!(
            "Piper executable not found at {}; synthesis requests will fail",
            synthesis.piper_bin.display()
        );
    }

    if cfg!(debug_assertions) {
        tracing::debug!("Full config: {:#?}", config);
    }
}

async fn shutdown_signal<R: ProcessRunner>(service: SynthesisService<R>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    service.shutdown();
}
