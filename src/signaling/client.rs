//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Authentifizierung mit dem Session Token
//! - Reader/Writer Tasks
//! - Ping/Pong als Erreichbarkeitstest
//! - Event-basierte Weitergabe an den Call Core

use super::messages::*;
use super::transport::{CallTransport, SignalingError, TransportEvent};
use crate::credentials::AuthSession;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

type PendingPongs = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: String,
    auth: Arc<dyn AuthSession>,
    probe_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<TransportEvent>,
    pending_pongs: PendingPongs,
    next_nonce: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: String, auth: Arc<dyn AuthSession>, probe_timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            server_url,
            auth,
            probe_timeout,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
            pending_pongs: Arc::new(Mutex::new(HashMap::new())),
            next_nonce: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Baut die WebSocket URL aus der Server URL (http → ws, https → wss)
    pub fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
        let mut url =
            Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingError::ConnectionFailed(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::ConnectionFailed("invalid scheme".to_string()))?;
        url.set_path("/ws");
        Ok(url)
    }

    /// Serialisiert und sendet eine Nachricht
    async fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        let msg_string =
            serde_json::to_string(&msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(msg_string)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<TransportEvent>,
        auth_tx: &mpsc::Sender<Result<String, SignalingError>>,
        pending_pongs: &PendingPongs,
    ) {
        match msg {
            ServerMessage::Authenticated { user_id } => {
                tracing::info!("Authenticated as {}", user_id);
                // Erst nach dem Auth-Ack gilt die Verbindung als online
                state.write().is_connected = true;
                let _ = auth_tx.try_send(Ok(user_id));
                let _ = event_tx.send(TransportEvent::Connected);
            }

            ServerMessage::Invite {
                call_id,
                from_peer_id,
                video,
            } => {
                let _ = event_tx.send(TransportEvent::Invite {
                    call_id,
                    from_peer_id,
                    video,
                });
            }

            ServerMessage::Signal {
                call_id,
                from_peer_id,
                signal,
            } => {
                let _ = event_tx.send(TransportEvent::Signal {
                    call_id,
                    from_peer_id,
                    signal,
                });
            }

            ServerMessage::Status {
                call_id,
                from_peer_id,
                status,
                reason,
            } => {
                let _ = event_tx.send(TransportEvent::Status {
                    call_id,
                    from_peer_id,
                    status,
                    reason,
                });
            }

            ServerMessage::Pong { nonce } => {
                if let Some(waiter) = pending_pongs.lock().remove(&nonce) {
                    let _ = waiter.send(());
                }
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                // Bei Auth-Fehlern auch dem auth_tx melden
                let _ = auth_tx.try_send(Err(SignalingError::ServerError {
                    code,
                    message: message.clone(),
                }));
                let _ = event_tx.send(TransportEvent::Error { code, message });
            }
        }
    }
}

#[async_trait]
impl CallTransport for SignalingClient {
    async fn connect(&self) -> Result<(), SignalingError> {
        let token = self
            .auth
            .access_token()
            .ok_or_else(|| SignalingError::AuthenticationFailed("no session".to_string()))?;

        // Alte Verbindung aufräumen
        self.disconnect().await;

        let ws_url = Self::websocket_url(&self.server_url)?;
        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);

        let (auth_tx, mut auth_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let pending_pongs = Arc::clone(&self.pending_pongs);
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => Self::handle_server_message(
                            server_msg,
                            &state,
                            &event_tx,
                            &auth_tx,
                            &pending_pongs,
                        ),
                        Err(e) => tracing::warn!("Dropping malformed server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(TransportEvent::Disconnected);
        });

        // Write-Task
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.tasks.lock().extend([reader, writer]);

        let result = match self.send(ClientMessage::Authenticate { token }).await {
            Ok(()) => tokio::select! {
                result = auth_rx.recv() => match result {
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => Err(e),
                    None => Err(SignalingError::AuthenticationFailed("No response".to_string())),
                },
                _ = tokio::time::sleep(AUTH_TIMEOUT) => {
                    Err(SignalingError::AuthenticationFailed("Timeout".to_string()))
                }
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            tracing::warn!("Signaling authentication failed: {}", e);
            self.disconnect().await;
        }
        result
    }

    async fn disconnect(&self) {
        self.tx.write().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending_pongs.lock().clear();

        let was_connected = std::mem::take(&mut self.state.write().is_connected);
        if was_connected {
            let _ = self.event_tx.send(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    async fn probe(&self) -> Result<(), SignalingError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending_pongs.lock().insert(nonce, waiter_tx);

        if let Err(e) = self.send(ClientMessage::Ping { nonce }).await {
            self.pending_pongs.lock().remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(self.probe_timeout, waiter_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SignalingError::NotConnected),
            Err(_) => {
                self.pending_pongs.lock().remove(&nonce);
                Err(SignalingError::ProbeTimeout)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn invite(
        &self,
        call_id: &CallId,
        to_peer_id: &str,
        video: bool,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Invite {
            call_id: call_id.clone(),
            to_peer_id: to_peer_id.to_string(),
            video,
        })
        .await
    }

    async fn publish(
        &self,
        call_id: &CallId,
        to_peer_id: &str,
        signal: SignalEnvelope,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Signal {
            call_id: call_id.clone(),
            to_peer_id: to_peer_id.to_string(),
            signal,
        })
        .await
    }

    async fn update_status(
        &self,
        call_id: &CallId,
        to_peer_id: &str,
        status: RemoteStatus,
        reason: Option<String>,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Status {
            call_id: call_id.clone(),
            to_peer_id: to_peer_id.to_string(),
            status,
            reason,
        })
        .await
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}
