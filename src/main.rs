use clap::Parser;
use rotor::{Rotor, RotorConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rotor")]
#[command(about = "Routes events through per-connection function chains", long_about = None)]
struct Cli {
    /// JSON config file; environment variables override it
    #[arg(short, long, env = "ROTOR_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Run only the HTTP service, without consuming
    #[arg(long)]
    http_only: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        rotor::init_tracing_pretty();
    } else {
        rotor::init_tracing();
    }

    let mut config = match &cli.config {
        Some(path) => RotorConfig::from_file(path)?,
        None => RotorConfig::default(),
    };
    config.apply_env()?;
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    let rotor = Rotor::start(config).await?;
    info!("Rotor {} started", rotor::VERSION);

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    #[cfg(feature = "service")]
    {
        use rotor::service::RotorService;
        use std::sync::Arc;

        let service = RotorService::new(rotor.dispatcher.clone())
            .with_store(Arc::new(rotor.connections.clone()))
            .with_store(Arc::new(rotor.functions.clone()))
            .with_api_key(std::env::var("ROTOR_AUTH_TOKEN").ok());
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], rotor.config.http_port));
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = service.serve(addr, token).await {
                error!("HTTP service failed: {}", e);
            }
        });
    }

    if !cli.http_only {
        run_consumer(&rotor, &mut tasks, shutdown.clone())?;
    }

    wait_for_shutdown().await?;
    info!("Shutdown signal received");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    rotor.stop().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await
}

#[cfg(feature = "kafka")]
fn run_consumer(
    rotor: &Rotor,
    tasks: &mut tokio::task::JoinSet<()>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use rotor::consumer::kafka::{KafkaPublisher, KafkaSource};
    use rotor::consumer::ConsumerOrchestrator;
    use std::sync::Arc;

    let config = rotor.config.consumer.clone();
    let source = KafkaSource::connect(&config)?;
    let publisher = Arc::new(KafkaPublisher::connect(&config)?);
    let orchestrator = Arc::new(ConsumerOrchestrator::new(
        config.clone(),
        rotor.dispatcher.clone(),
        publisher,
    ));
    tasks.spawn(async move {
        if let Err(e) = rotor::consumer::kafka::ensure_topics(&config).await {
            error!("Topic bootstrap failed: {}", e);
        }
        if let Err(e) = orchestrator.run(source, shutdown).await {
            error!("Consumer failed: {}", e);
        }
    });
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn run_consumer(
    _rotor: &Rotor,
    _tasks: &mut tokio::task::JoinSet<()>,
    _shutdown: CancellationToken,
) -> anyhow::Result<()> {
    anyhow::bail!("built without the kafka feature; run with --http-only")
}
