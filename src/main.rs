//! mcp-hub binary entry point.

use std::sync::Arc;

use clap::Parser;
use mcp_hub::api::{create_router, AppState};
use mcp_hub::cli::{Cli, Commands, ServeArgs, StdioArgs};
use mcp_hub::config::HubConfig;
use mcp_hub::error::HubError;
use mcp_hub::instance::{FileInstanceStore, InstanceManager, InstanceStore};
use mcp_hub::logging::{init_tracing, register_sink, LogBuffer};
use mcp_hub::router::{Router, RouterConfig, RouterOptions, TransportMode};
use rmcp::model::Implementation;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => handle_serve(args).await,
        Commands::Stdio(args) => handle_stdio(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn handle_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = HubConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    init_tracing(&config.log_level, config.log_format, false)?;

    let logs = Arc::new(LogBuffer::new());
    let _sink = register_sink(Arc::clone(&logs));

    let store = Arc::new(FileInstanceStore::new(&config.data_file));
    let manager = Arc::new(
        InstanceManager::new(store)
            .with_reconnect_delay(config.reconnect_delay())
            .with_public_base(config.public_base()),
    );
    let restored = manager.initialize().await?;
    tracing::info!(
        restored,
        data_file = %config.data_file.display(),
        "instances restored"
    );

    let app = create_router(Arc::new(AppState::new(Arc::clone(&manager), logs)));
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, "mcp-hub listening");

    // Closing the routers first ends every open SSE stream, so the server can drain.
    let shutdown_manager = Arc::clone(&manager);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
            shutdown_manager.shutdown().await;
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}

async fn handle_stdio(args: StdioArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = HubConfig::load(args.config.as_deref())?;
    init_tracing(&config.log_level, config.log_format, true)?;

    let store = FileInstanceStore::new(&config.data_file);
    let instance = store
        .get(&args.instance)
        .await?
        .ok_or_else(|| HubError::not_found("instance", &args.instance))?;

    let router = Router::new(
        RouterOptions::builder()
            .instance_id(instance.id.as_str())
            .mode(TransportMode::Stdio)
            .reconnect_delay(config.reconnect_delay())
            .server_info(Implementation {
                name: instance.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Implementation::default()
            })
            .build(),
    );
    router
        .import_config(&RouterConfig::from_instance(&instance))
        .await?;
    router.start().await?;
    if let Some(address) = instance.outbound_address() {
        router.connect_outbound(address).await?;
    }

    let server = router.default_server();
    tokio::select! {
        _ = server.stopped() => tracing::info!(instance_id = %instance.id, "stdio peer disconnected"),
        _ = tokio::signal::ctrl_c() => tracing::info!(instance_id = %instance.id, "interrupted"),
    }
    router.close().await;
    Ok(())
}
