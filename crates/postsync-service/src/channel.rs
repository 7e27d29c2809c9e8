use axum::extract::ws::{Message, WebSocket};
use postsync_core::Channel;
use tracing::{debug, info, warn};

/// Reply to every inbound text frame with exactly one text frame until the
/// peer goes away. Disconnects end the loop quietly.
pub(crate) async fn run_channel(mut socket: WebSocket, channel: Channel) {
    let name = channel.as_str();
    info!(channel = name, "websocket connected");

    loop {
        let frame = match socket.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(channel = name, error = %err, "websocket receive failed; closing");
                break;
            }
            None => {
                info!(channel = name, "websocket disconnected");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                let reply = channel.reply(&text);
                if let Err(err) = socket.send(Message::Text(reply)).await {
                    info!(channel = name, error = %err, "websocket disconnected during send");
                    break;
                }
                info!(channel = name, message = %text, "received message");
            }
            Message::Close(frame) => {
                info!(channel = name, frame = ?frame, "websocket disconnected");
                break;
            }
            Message::Binary(data) => {
                debug!(channel = name, bytes = data.len(), "ignoring binary frame");
            }
            // axum answers pings on its own
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}
