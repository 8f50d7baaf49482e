use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use log::{info, error};

use tickstream::api::{create_api_router, ApiState};
use tickstream::config::{Config, STATS_INTERVAL_SECS};
use tickstream::data::{mix, DataLoader, DataProducer, Hub, HubConfig, HubHandle, Provider};
use tickstream::websocket;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let producers = build_producers(&config)?;
    info!("Configured {} producers", producers.len());

    let (hub, hub_handle) = Hub::new(HubConfig::default());
    hub.spawn();

    hub_handle.attach(mix(&producers));

    start_background_tasks(hub_handle.clone());

    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    let ws_address = ws_listener.local_addr()?;
    info!(
        "WebSocket server running at ws://{}{}",
        ws_address,
        websocket::WEBSOCKET_PATH
    );

    let api_state = ApiState::new(hub_handle.clone(), ws_address.port());
    let api_router = create_api_router(api_state, &config.static_dir);
    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("HTTP server running at http://{}", config.api_bind_address);

    tokio::select! {
        result = axum::serve(api_listener, api_router) => {
            error!("HTTP server stopped: {:?}", result);
        }
        _ = websocket::serve(ws_listener, hub_handle, config.lane_capacity) => {
            error!("WebSocket server stopped");
        }
    }

    Ok(())
}

fn build_producers(config: &Config) -> Result<Vec<Box<dyn DataProducer>>, Box<dyn std::error::Error>> {
    let mut producers: Vec<Box<dyn DataProducer>> = config
        .providers
        .iter()
        .map(|name| {
            Box::new(
                Provider::new(name.as_str())
                    .with_interval(config.tick_interval())
                    .with_price_range(config.base_price, config.price_spread),
            ) as Box<dyn DataProducer>
        })
        .collect();

    if let Some(dir) = &config.replay_dir {
        for replay in DataLoader::load_replay_dir(Path::new(dir), config.tick_interval())? {
            if config.providers.iter().any(|name| name == replay.name()) {
                error!("Replay source {} shadows a configured provider, skipping it", replay.name());
                continue;
            }
            producers.push(Box::new(replay));
        }
    }

    if producers.is_empty() {
        return Err("no producers configured".into());
    }

    Ok(producers)
}

fn start_background_tasks(hub: HubHandle) {
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(STATS_INTERVAL_SECS));

        loop {
            interval_timer.tick().await;
            match hub.stats().await {
                Some(stats) => info!(
                    "Stats - Subscribers: {}, Published: {}, Delivered: {}, Dropped: {}",
                    stats.subscribers, stats.published, stats.delivered, stats.dropped
                ),
                None => break,
            }
        }
    });

    info!("Started stats monitoring task (every {} seconds)", STATS_INTERVAL_SECS);
}
