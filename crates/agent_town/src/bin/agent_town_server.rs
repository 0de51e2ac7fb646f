use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use agent_town::autonomy::{AutonomyEngine, OpenAiDecisionClient};
use agent_town::config::ServerConfig;
use agent_town::runtime::{ServerClock, WorldRuntime};
use agent_town::simulator::{World, WorldSnapshot};
use agent_town::viewer::ViewerServer;

#[derive(Debug, Parser)]
#[command(
    name = "agent_town_server",
    about = "Runs the town simulation and pushes every tick to viewers"
)]
struct Cli {
    /// TOML config file. Defaults to ./agent_town.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Viewer listen address, overriding the config.
    #[arg(long)]
    bind: Option<String>,
    /// Tick period in milliseconds, overriding the config.
    #[arg(long)]
    tick_ms: Option<u64>,
    /// Run without decision cycles.
    #[arg(long)]
    no_autonomy: bool,
    /// Run without the viewer listener.
    #[arg(long)]
    no_viewer: bool,
    /// Snapshot file restored at start (when it exists) and written on exit.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Stop after this many ticks.
    #[arg(long)]
    ticks: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut config =
        ServerConfig::load_or_default(cli.config.as_deref()).context("load server config")?;
    if let Some(bind) = &cli.bind {
        config.viewer.bind_addr = bind.clone();
    }
    if let Some(tick_ms) = cli.tick_ms {
        config.world.tick_ms = tick_ms;
    }
    if cli.no_autonomy {
        config.autonomy.enabled = false;
    }
    if cli.no_viewer {
        config.viewer.enabled = false;
    }
    config.validate().context("validate server config")?;

    let mut world = World::generate(config.world_settings(), config.collaborators())
        .context("generate world grid")?;
    if let Some(path) = cli.snapshot.as_ref().filter(|path| path.exists()) {
        let snapshot = WorldSnapshot::load_json(path)
            .with_context(|| format!("load snapshot {}", path.display()))?;
        world
            .restore(snapshot)
            .with_context(|| format!("restore snapshot {}", path.display()))?;
        tracing::info!(path = %path.display(), tick = world.tick(), "snapshot restored");
    }

    let mut runtime = WorldRuntime::new(world, config.runtime_settings(), ServerClock::start());
    if config.autonomy.enabled {
        if config.llm.is_configured() {
            let client = OpenAiDecisionClient::from_settings(&config.llm)
                .context("build decision client")?;
            let engine = AutonomyEngine::new(
                config.autonomy.clone(),
                config.llm.system_prompt.clone(),
                Arc::new(client),
            );
            runtime = runtime.with_autonomy(Arc::new(engine));
        } else {
            tracing::warn!("decision service not configured; autonomy disabled");
        }
    }

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let viewer = if config.viewer.enabled {
        let server = ViewerServer::bind(config.viewer_settings(), runtime.broadcaster())
            .await
            .with_context(|| format!("bind viewer on {}", config.viewer.bind_addr))?;
        let mut stop = stop_rx.clone();
        Some(tokio::spawn(server.run(async move {
            let _ = stop.changed().await;
        })))
    } else {
        None
    };

    let ticks = runtime
        .run(
            async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %err, "ctrl-c handler unavailable");
                    std::future::pending::<()>().await;
                }
            },
            cli.ticks,
        )
        .await;
    runtime.shutdown();
    let _ = stop_tx.send(true);
    if let Some(handle) = viewer {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "viewer server stopped with error"),
            Err(err) => tracing::warn!(error = %err, "viewer server task failed"),
        }
    }

    if let Some(path) = &cli.snapshot {
        runtime
            .snapshot()
            .save_json(path)
            .with_context(|| format!("save snapshot {}", path.display()))?;
        tracing::info!(path = %path.display(), ticks, "snapshot saved");
    }
    Ok(())
}
