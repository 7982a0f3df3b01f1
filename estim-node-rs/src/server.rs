//! WebSocket listener
//!
//! Each accepted socket gets a reader loop that forwards text frames to the
//! coordinator and a writer task that drains the connection's outbound
//! channel. The coordinator closes the outbound channel when it forgets the
//! connection, which ends the writer and closes the socket.
//!
//! The listener outlives the session: sockets arriving after the end are told
//! `SESSION_ENDED` and closed.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
};
use tracing::{debug, error, info, warn};

use estim_core::{CoordinatorClosed, CoordinatorHandle, RejectedReason, ServerMessage};

/// Largest accepted client message
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Largest accepted client frame
const MAX_FRAME_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Closed(#[from] CoordinatorClosed),
}

/// Accepts WebSocket clients for one session
pub struct Server {
    listener: TcpListener,
    handle: CoordinatorHandle,
}

impl Server {
    pub async fn bind(addr: SocketAddr, handle: CoordinatorHandle) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handle })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            };
            let handle = self.handle.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer, handle).await {
                    warn!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }
}

fn session_ended() -> Message {
    let reason = RejectedReason::SessionEnded;
    let frame = ServerMessage::error(reason.code(), reason.to_string());
    match frame.to_json() {
        Ok(text) => Message::Text(text.into()),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            Message::Close(None)
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handle: CoordinatorHandle,
) -> Result<(), ServerError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };
    let mut ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
    let (connection, mut outbound) = match handle.open_connection().await {
        Ok(opened) => opened,
        Err(CoordinatorClosed) => {
            info!("Refusing {}: session has ended", peer);
            ws_stream.send(session_ended()).await?;
            ws_stream.close(None).await?;
            return Ok(());
        }
    };
    info!("Connection {} from {}", connection, peer);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Spawn sender task
    let coordinator = handle.clone();
    let writer = tokio::spawn(async move {
        let mut ended = false;
        while let Some(msg) = outbound.recv().await {
            ended |= matches!(msg, ServerMessage::SessionEnded { .. });
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            debug!("Sending to {}: {}", connection, text);
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                debug!("Failed to send to {}: {}", connection, e);
                break;
            }
        }
        // Opened after the final event was taken off the queue
        if !ended && coordinator.is_closed() {
            let _ = ws_tx.send(session_ended()).await;
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        let delivered = match frame {
            Ok(Message::Text(text)) => {
                debug!("Received from {}: {}", connection, text);
                handle.submit_text(connection, &text).await
            }
            Ok(Message::Binary(_)) => {
                handle
                    .submit_malformed(connection, "binary frames are not supported")
                    .await
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Read error on connection {}: {}", connection, e);
                break;
            }
        };
        if delivered.is_err() {
            break;
        }
    }

    info!("Connection {} closed", connection);
    let _ = handle.close_connection(connection).await;
    let _ = writer.await;
    Ok(())
}
