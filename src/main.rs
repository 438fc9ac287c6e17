use std::error::Error;
use std::path::PathBuf;

use burn::backend::Autodiff;
use dotenv::dotenv;
use hideseek::config::{Mode, Settings};
use hideseek::infra::BridgeServer;
use hideseek::rl::{HideSeekEnv, Trainer, burn_agents};
use hideseek::sim::arena_world;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[cfg(feature = "metal")]
type Backend = Autodiff<burn::backend::Metal>;
#[cfg(not(feature = "metal"))]
type Backend = Autodiff<burn::backend::NdArray>;

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hideseek=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// `"latest"` picks the newest periodic checkpoint
fn checkpoint_dir(resume_from: &str) -> Option<PathBuf> {
    (resume_from != "latest").then(|| PathBuf::from(resume_from))
}

async fn train(settings: Settings, env: HideSeekEnv) -> Result<(), Box<dyn Error>> {
    let device = Default::default();
    let agents = burn_agents::<Backend>(&settings.train, env.state_size(), &device);
    let resume_from = settings.train.resume_from.clone();
    let mut trainer = Trainer::new(settings.train, env, agents);

    if let Some(from) = resume_from {
        trainer.resume(checkpoint_dir(&from).as_deref())?;
    }

    tokio::select! {
        _ = trainer.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, saving final checkpoint");
        }
    }

    let path = trainer.finish().await?;
    tracing::info!("Final checkpoint at {}", path.display());
    Ok(())
}

async fn demo(settings: Settings, env: HideSeekEnv) -> Result<(), Box<dyn Error>> {
    let device = Default::default();
    let agents = burn_agents::<Backend>(&settings.train, env.state_size(), &device);
    let resume_from = settings.train.resume_from.clone();
    let episodes = settings.train.demo_episodes;
    let mut trainer = Trainer::new(settings.train, env, agents);

    let dir = resume_from.as_deref().and_then(checkpoint_dir);
    if let Err(e) = trainer.resume(dir.as_deref()) {
        tracing::warn!("Playing with untrained models: {}", e);
    }

    tokio::select! {
        _ = trainer.run_demo(episodes) => {}
        _ = tokio::signal::ctrl_c() => tracing::warn!("Interrupted"),
    }
    trainer.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    init_logging();

    let settings = Settings::load()?;
    tracing::info!("Mode: {:?}", settings.mode);

    let env = HideSeekEnv::new(arena_world(settings.arena.clone()), settings.train.env.clone());
    match settings.mode {
        Mode::Train => train(settings, env).await?,
        Mode::Demo => demo(settings, env).await?,
        Mode::Serve => {
            let server = BridgeServer::bind(settings.bridge_addr.as_str(), env).await?;
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, stopping bridge"),
            }
        }
    }

    Ok(())
}
