use std::time::Duration;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response, ErrorResponse};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use log::{debug, info, warn, error};

use crate::config::HEARTBEAT_INTERVAL_SECS;
use crate::data::{HubHandle, Lane, LaneReceiver};

pub const WEBSOCKET_PATH: &str = "/ws";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Accepts WebSocket connections forever, one task per peer.
pub async fn serve(listener: TcpListener, hub: HubHandle, lane_capacity: usize) {
    info!("Ready to accept WebSocket connections on {}", WEBSOCKET_PATH);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = WebSocketHandler::new(hub.clone(), addr.to_string(), lane_capacity);
                tokio::spawn(handler.handle_connection(stream));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                // Usually out of file descriptors; give the OS a moment.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

pub struct WebSocketHandler {
    hub: HubHandle,
    peer_addr: String,
    lane_capacity: usize,
}

impl WebSocketHandler {
    pub fn new(hub: HubHandle, peer_addr: String, lane_capacity: usize) -> Self {
        Self {
            hub,
            peer_addr,
            lane_capacity,
        }
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let ws_stream = match accept_hdr_async(stream, |req: &Request, response: Response| {
            self.check_path(req, response)
        }).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {}: {}", self.peer_addr, e);
                return;
            }
        };

        self.handle_websocket_connection(ws_stream).await;
    }

    fn check_path(&self, req: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        if path == WEBSOCKET_PATH {
            debug!("WebSocket connection request for {} from {}", path, self.peer_addr);
            Ok(response)
        } else {
            warn!("Unknown WebSocket path '{}' from {}", path, self.peer_addr);
            let mut error = ErrorResponse::new(Some("Invalid WebSocket path".to_string()));
            *error.status_mut() = StatusCode::NOT_FOUND;
            Err(error)
        }
    }

    async fn handle_websocket_connection(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (write, read) = ws_stream.split();

        let (lane, lane_rx) = Lane::new(self.lane_capacity);
        let lane_id = lane.id();
        self.hub.subscribe(lane).await;

        info!("WebSocket connection established - lane {} for {}", lane_id, self.peer_addr);

        let (close_tx, close_rx) = mpsc::channel::<()>(1);

        let mut write_task = self.spawn_write_task(write, lane_rx, close_rx);
        let mut read_task = self.spawn_read_task(read, close_tx);

        tokio::select! {
            _ = &mut write_task => {
                debug!("Write task completed for lane {}", lane_id);
                read_task.abort();
            }
            _ = &mut read_task => {
                debug!("Read task completed for lane {}", lane_id);
                write_task.abort();
            }
        }

        self.hub.unsubscribe(lane_id).await;

        info!("WebSocket connection closed - lane {} for {}", lane_id, self.peer_addr);
    }

    fn spawn_write_task(
        &self,
        mut write: WsSink,
        mut lane_rx: LaneReceiver,
        mut close_rx: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        let peer_addr = self.peer_addr.clone();

        tokio::spawn(async move {
            let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            // The first tick fires immediately.
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    event = lane_rx.recv() => {
                        let Some(event) = event else {
                            info!("Lane closed by hub, closing connection to {}", peer_addr);
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Stream closed".into(),
                            };
                            if let Err(e) = write.send(Message::Close(Some(frame))).await {
                                debug!("Error sending close frame to {}: {}", peer_addr, e);
                            }
                            break;
                        };

                        match event.to_json() {
                            Ok(json) => {
                                if let Err(e) = write.send(Message::Text(json)).await {
                                    warn!("Error sending to {}: {}", peer_addr, e);
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("Failed to serialize event from {}: {}", event.provider_name, e);
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!("Heartbeat to {} failed: {}", peer_addr, e);
                            break;
                        }
                    }
                    _ = close_rx.recv() => {
                        debug!("Received close signal for {}", peer_addr);
                        break;
                    }
                }
            }
        })
    }

    fn spawn_read_task(&self, mut read: WsSource, close_tx: mpsc::Sender<()>) -> JoinHandle<()> {
        let peer_addr = self.peer_addr.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Close(close_frame)) => {
                        debug!("Received close frame from {}: {:?}", peer_addr, close_frame);
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                        debug!("Heartbeat from {}", peer_addr);
                    }
                    Ok(Message::Text(text)) => {
                        debug!("Ignoring text message from {}: {}", peer_addr, text);
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring binary message from {}: {} bytes", peer_addr, data.len());
                    }
                    Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        warn!("Error reading from {}: {}", peer_addr, e);
                        break;
                    }
                }
            }

            if close_tx.send(()).await.is_err() {
                debug!("Write task for {} already gone", peer_addr);
            }
        })
    }
}
