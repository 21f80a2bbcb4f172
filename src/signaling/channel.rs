//! Signaling channel task
//!
//! Owns the WebSocket connection to the relay. Connects on demand,
//! retries within a fixed attempt budget, and reports every
//! connectivity transition. The channel buffers nothing: a send while
//! disconnected is dropped with a warning, and any queuing is the
//! controller's responsibility.

use super::protocol::RelayMessage;
use super::ChannelState;
use crate::config::SignalingConfig;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Commands accepted by the channel task
#[derive(Debug)]
pub enum ChannelCommand {
    /// Establish connectivity (no-op when already connected)
    Connect,
    /// Fire-and-forget send; dropped when not connected
    Send(RelayMessage),
    /// Close the connection and stop the task
    Shutdown,
}

/// Events emitted toward the controller
#[derive(Debug)]
pub enum ChannelEvent {
    State(ChannelState),
    Message(RelayMessage),
}

/// WebSocket client for the signaling relay
pub struct SignalingChannel {
    url: String,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl SignalingChannel {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_attempts: config.connect_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Start the channel task. Returns the command handle and the
    /// event stream for the controller to consume.
    pub fn spawn(
        self,
    ) -> (
        mpsc::UnboundedSender<ChannelCommand>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(cmd_rx, event_tx));
        (cmd_tx, event_rx)
    }

    async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
        event_tx: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        loop {
            // Disconnected: wait for a connect request
            match cmd_rx.recv().await {
                None | Some(ChannelCommand::Shutdown) => return,
                Some(ChannelCommand::Send(msg)) => {
                    warn!("Dropping {} send while disconnected", msg.kind());
                    continue;
                }
                Some(ChannelCommand::Connect) => {}
            }

            loop {
                let stream = match self.connect(&event_tx).await {
                    Some(stream) => stream,
                    None => {
                        // Budget exhausted: surface failure, go back to
                        // waiting for the next connect request.
                        let _ = event_tx.send(ChannelEvent::State(ChannelState::Failed));
                        break;
                    }
                };

                let _ = event_tx.send(ChannelEvent::State(ChannelState::Connected));
                info!("Connected to relay at {}", self.url);

                match self.serve(stream, &mut cmd_rx, &event_tx).await {
                    ServeOutcome::Shutdown => return,
                    ServeOutcome::ConnectionLost => {
                        warn!("Relay connection lost, reconnecting");
                        let _ = event_tx.send(ChannelEvent::State(ChannelState::Disconnected));
                    }
                }
            }
        }
    }

    /// Try to establish a connection within the attempt budget.
    async fn connect(
        &self,
        event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    ) -> Option<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>
    {
        let _ = event_tx.send(ChannelEvent::State(ChannelState::Connecting));

        for attempt in 1..=self.connect_attempts {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => return Some(stream),
                Err(e) => {
                    warn!(
                        "Relay connect attempt {}/{} failed: {}",
                        attempt, self.connect_attempts, e
                    );
                    if attempt < self.connect_attempts {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!(
            "Relay unreachable after {} attempts: {}",
            self.connect_attempts, self.url
        );
        None
    }

    /// Pump one established connection until it drops or we shut down.
    async fn serve(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        cmd_rx: &mut mpsc::UnboundedReceiver<ChannelCommand>,
        event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    ) -> ServeOutcome {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(ChannelCommand::Shutdown) => {
                        let _ = write.send(Message::Close(None)).await;
                        return ServeOutcome::Shutdown;
                    }
                    Some(ChannelCommand::Connect) => {
                        debug!("Connect requested while already connected");
                    }
                    Some(ChannelCommand::Send(msg)) => match msg.to_json() {
                        Ok(text) => {
                            debug!("Relay send: {}", msg.kind());
                            if write.send(Message::Text(text)).await.is_err() {
                                return ServeOutcome::ConnectionLost;
                            }
                        }
                        Err(e) => warn!("Failed to encode {}: {}", msg.kind(), e),
                    },
                },

                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match RelayMessage::from_json(&text) {
                        Ok(msg) => {
                            let _ = event_tx.send(ChannelEvent::Message(msg));
                        }
                        Err(e) => debug!("Ignoring unparseable relay frame: {}", e),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return ServeOutcome::ConnectionLost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return ServeOutcome::ConnectionLost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Relay socket error: {}", e);
                        return ServeOutcome::ConnectionLost;
                    }
                },
            }
        }
    }
}

enum ServeOutcome {
    Shutdown,
    ConnectionLost,
}
