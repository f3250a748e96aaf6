use anyhow::{Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use story_player::cache::{ContentCache, HttpTransport};
use story_player::config::Settings;
use story_player::history::{JsonFileStore, ViewHistory};
use story_player::media::backend::default_decoders;
use story_player::media::ControllerFactory;
use story_player::model::Collection;
use story_player::{OrchestratorBuilder, PlaybackEvent, StartAt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("STORY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("story-player.toml"));
    let settings = Settings::load(Some(&config_path)).context("Failed to load settings")?;

    let client = Client::new();
    let collection = match std::env::args().nth(1) {
        Some(path) => read_collection(Path::new(&path)).await?,
        None => fetch_collection(&client, &settings).await?,
    };
    tracing::info!(
        "Loaded {} items in {} groups",
        collection.total_items(),
        collection.groups.len()
    );

    let transport = Arc::new(HttpTransport::new(
        client,
        settings.source.bearer_token.clone(),
    ));
    let cache = ContentCache::open(&settings.cache, settings.retry.clone(), transport)
        .context("Failed to open content cache")?;
    let decoders = default_decoders().context("Failed to initialize decoders")?;
    let factory = ControllerFactory::new(cache.clone(), decoders, settings.playback.clone());

    let store = JsonFileStore::open(settings.cache.dir.join("history.json"))
        .context("Failed to open view history")?;
    let history = ViewHistory::new(Arc::new(store));

    let (handle, mut events, task) = OrchestratorBuilder::new(collection, factory, settings.playback.clone())
        .start_at(StartAt::FirstUnviewed)
        .history(history)
        .spawn()
        .context("Failed to start playback")?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PlaybackEvent::Completed) => {
                    tracing::info!("All stories played");
                    break;
                }
                Some(PlaybackEvent::ProgressTick(_)) => {}
                Some(event) => tracing::info!("{:?}", event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    handle.dispose().await;
    cache.dispose();
    if let Err(e) = task.await {
        tracing::error!("Playback task failed: {}", e);
    }

    Ok(())
}

async fn read_collection(path: &Path) -> Result<Collection> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Collection::from_json(&json).with_context(|| format!("Invalid collection in {}", path.display()))
}

async fn fetch_collection(client: &Client, settings: &Settings) -> Result<Collection> {
    let mut request = client.get(&settings.source.playlist_url);
    if let Some(ref token) = settings.source.bearer_token {
        request = request.bearer_auth(token);
    }
    let json = request
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Collection::from_json(&json).context("Invalid collection from playlist endpoint")
}
