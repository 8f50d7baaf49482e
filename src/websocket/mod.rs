pub mod handler;

pub use handler::{serve, WebSocketHandler, WEBSOCKET_PATH};
