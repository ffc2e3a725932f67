use financial_assistant_orchestrator::{
    api::{start_server, SessionHub},
    audit::SessionArchive,
    config::OrchestratorConfig,
    execution::ToolExecutor,
    gateway::{GeminiGateway, RetryingGateway},
    tools::create_default_registry,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = OrchestratorConfig::from_env()?;
    if config.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY not set in .env; model calls will be rejected");
    }

    info!("Financial Assistant - API Server");
    info!(
        port = config.api_port,
        model = %config.gemini_model,
        max_tool_rounds = config.max_tool_rounds,
        streaming = config.streaming,
        "Configuration loaded"
    );

    // Create components
    let gateway = RetryingGateway::new(GeminiGateway::new(&config)?, config.retry.clone());
    let registry = create_default_registry()?;
    let executor = ToolExecutor::new(Arc::new(registry), config.tool_timeout);
    let archive = Arc::new(SessionArchive::with_capacity(config.archive_capacity));

    let port = config.api_port;
    let hub = Arc::new(SessionHub::new(Arc::new(gateway), executor, archive, config));

    info!("Session hub initialized, starting API server");

    start_server(hub, port).await?;

    Ok(())
}
