use std::sync::Arc;

use openclaw_core::config::CoreConfig;
use openclaw_core::executor::UnconfiguredExecutor;
use openclaw_core::gateway::Gateway;
use openclaw_core::runtime::CoreRuntime;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CoreConfig::from_env();
    tokio::fs::create_dir_all(&config.state_dir).await?;

    eprintln!("🦞 openclawd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   State dir: {}", config.state_dir.display());
    eprintln!("   Agent: {}", config.agent_id);
    eprintln!("   Gateway: port {}\n", config.gateway.port);

    // The agent executor is provided by the outer runtime; standalone the
    // daemon still serves the gateway, cron bookkeeping, and stores.
    let runtime = CoreRuntime::build(config, Arc::new(UnconfiguredExecutor));
    runtime.start().await?;

    let gateway = Gateway::new(runtime);
    let listeners = gateway.bind().await?;
    let mut serving = Vec::new();
    for listener in listeners {
        let gateway = gateway.clone();
        serving.push(tokio::spawn(gateway.serve(listener)));
    }

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down...");
    gateway.shutdown().await;
    for handle in serving {
        let _ = handle.await;
    }

    Ok(())
}
