//! End-to-end: producers → mixer → hub → WebSocket client.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use tickstream::data::{mix, DataProducer, Hub, HubConfig, HubHandle, Provider};
use tickstream::websocket;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(names: &[&str]) -> (SocketAddr, HubHandle) {
    let producers: Vec<Box<dyn DataProducer>> = names
        .iter()
        .map(|name| {
            Box::new(Provider::new(*name).with_interval(Duration::from_millis(5))) as Box<dyn DataProducer>
        })
        .collect();

    let (hub, handle) = Hub::new(HubConfig::default());
    hub.spawn();
    handle.attach(mix(&producers));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(websocket::serve(listener, handle.clone(), 16));

    (addr, handle)
}

async fn wait_for_subscribers(hub: &HubHandle, expected: usize) {
    timeout(WAIT, async {
        loop {
            if hub.stats().await.unwrap().subscribers == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

#[tokio::test]
async fn test_client_receives_price_json() {
    let (addr, _hub) = start_server(&["Bitcoin", "Ethereum"]).await;

    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    let mut seen = std::collections::HashSet::new();
    while seen.len() < 2 {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("no price received")
            .expect("stream ended")
            .unwrap();

        if let Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            let price = value["current_price"].as_f64().unwrap();
            assert!((100.0..110.0).contains(&price));
            assert!(value["timestamp"].is_string());
            seen.insert(value["provider_name"].as_str().unwrap().to_string());
        }
    }

    assert!(seen.contains("Bitcoin"));
    assert!(seen.contains("Ethereum"));
}

#[tokio::test]
async fn test_disconnect_unsubscribes_lane() {
    let (addr, hub) = start_server(&["Binance"]).await;

    let (mut first, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let (second, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    wait_for_subscribers(&hub, 2).await;

    first.send(Message::Close(None)).await.unwrap();
    wait_for_subscribers(&hub, 1).await;

    drop(second);
    wait_for_subscribers(&hub, 0).await;
}

#[tokio::test]
async fn test_unknown_path_is_rejected() {
    let (addr, hub) = start_server(&["Bitcoin"]).await;

    assert!(connect_async(format!("ws://{}/admin", addr)).await.is_err());
    assert_eq!(hub.stats().await.unwrap().subscribers, 0);
}
