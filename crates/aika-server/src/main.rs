mod app;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aika_core::config::AikaConfig;

use crate::app::App;

#[derive(Parser)]
#[command(name = "aika-server", about = "Persona chat agent backend")]
struct Args {
    /// Path to the TOML config (default: configs/aika.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Secrets and affection temperature overrides live in .env.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AikaConfig::load(args.config.as_deref())?;
    let app = App::build(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Scheduler: memory GC, blacklist sweep, graph cleanup.
    let scheduler = app.scheduler();
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    // Admin HTTP surface.
    let admin_state = app.admin_state();
    tokio::spawn(async move {
        if let Err(e) = aika_admin::serve(admin_state).await {
            tracing::error!("admin surface stopped: {e}");
        }
    });

    info!(
        persona = %app.config.role.name,
        "core up; attach a chat adapter via App::dispatcher to receive messages"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    Ok(())
}
