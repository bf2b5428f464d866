//! 实时对练网关：每个 WebSocket 连接对应一个处于实时模式的会话
//!
//! 连接地址 `ws://{addr}/live/{session_id}/stream`。读循环只做落库与确认，
//! 考官回复交给回复线程池，完成后经本连接的发送队列写回。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::message::{LiveClientMessage, LiveServerMessage};
use crate::core::error::CoachResult;
use crate::core::live::{ConnectionState, LiveController};
use crate::store::{LiveTurn, Task};

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket 监听地址；端口 0 表示随机端口
    pub bind_addr: String,
    /// 最大并发连接数
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            max_connections: 1000,
        }
    }
}

/// 已建立的连接
struct Connection {
    session_id: i64,
}

type Connections = Arc<RwLock<HashMap<String, Connection>>>;

type ReplyOutcome = Option<CoachResult<(Task, LiveTurn)>>;

pub struct LiveHub {
    config: HubConfig,
    live: LiveController,
    connections: Connections,
    shutdown: CancellationToken,
}

impl LiveHub {
    pub fn new(config: HubConfig, live: LiveController, shutdown: CancellationToken) -> Self {
        Self {
            config,
            live,
            connections: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// 绑定并在后台接受连接，返回实际监听地址
    pub async fn start(&self) -> Result<SocketAddr, String> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        tracing::info!("Live gateway listening on ws://{}", local);

        let shutdown = self.shutdown.clone();
        let connections = Arc::clone(&self.connections);
        let live = self.live.clone();
        let max_connections = self.config.max_connections;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Live gateway stopped accepting connections");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                if connections.read().await.len() >= max_connections {
                                    tracing::warn!("Connection limit reached, dropping {}", addr);
                                    continue;
                                }
                                let connections = Arc::clone(&connections);
                                let live = live.clone();
                                let shutdown = shutdown.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, live, connections, shutdown).await {
                                        tracing::error!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(local)
    }

    /// 停止接受新连接；已建立的连接在下一次循环时结束
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// 获取活跃连接数
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 某会话的活跃连接数
    pub async fn session_connections(&self, session_id: i64) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.session_id == session_id)
            .count()
    }
}

/// 解析 `/live/{session_id}/stream`
pub fn parse_session_path(path: &str) -> Option<i64> {
    let mut parts = path.trim_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("live"), Some(id), Some("stream"), None) => id.parse().ok(),
        _ => None,
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, message: &LiveServerMessage) {
    let _ = tx.send(message.to_json());
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    live: LiveController,
    connections: Connections,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await
    .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let Some(session_id) = parse_session_path(&path) else {
        send(&tx, &LiveServerMessage::error(None, format!("unknown live path {}", path)));
        return Ok(());
    };
    if let Err(e) = live.open(session_id).await {
        send(&tx, &LiveServerMessage::error(None, e.to_string()));
        return Ok(());
    }

    let client_id = format!("live_{}_{}", addr, uuid::Uuid::new_v4());
    connections
        .write()
        .await
        .insert(client_id.clone(), Connection { session_id });
    tracing::info!(session_id, %addr, "live connection opened");

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(i64, ReplyOutcome)>();
    let mut state = ConnectionState::Idle;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some((turn_index, outcome)) = done_rx.recv() => {
                state = ConnectionState::Idle;
                match outcome {
                    Some(Ok((_, turn))) => send(&tx, &LiveServerMessage::ExaminerReply {
                        turn: turn.turn_index,
                        text: turn.examiner_reply.unwrap_or_default(),
                    }),
                    Some(Err(e)) => send(&tx, &LiveServerMessage::error(Some(turn_index), e.to_string())),
                    None => send(&tx, &LiveServerMessage::error(Some(turn_index), "reply worker unavailable")),
                }
                // 轮次提醒跟在本轮回复之后
                if let Some(advisory) = live.advisory(turn_index) {
                    send(&tx, &advisory.into());
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    WsMessage::Text(text) => {
                        let client_msg: LiveClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                send(&tx, &LiveServerMessage::error(None, format!("invalid message: {}", e)));
                                continue;
                            }
                        };

                        match client_msg {
                            LiveClientMessage::Stop => {
                                send(&tx, &LiveServerMessage::Stopped);
                                break;
                            }
                            LiveClientMessage::CandidateTurn { text, followup } => {
                                if !state.can_accept_turn() {
                                    send(&tx, &LiveServerMessage::error(None, "reply pending"));
                                    continue;
                                }
                                let turn = match live.record_turn(session_id, &text, followup.as_deref()).await {
                                    Ok(turn) => turn,
                                    Err(e) => {
                                        send(&tx, &LiveServerMessage::error(None, e.to_string()));
                                        continue;
                                    }
                                };
                                let turn_index = turn.turn_index;
                                send(&tx, &LiveServerMessage::Ack { turn: turn_index });

                                state = ConnectionState::AwaitingReply { turn_index };
                                let handle = live.spawn_reply(turn.id);
                                let done_tx = done_tx.clone();
                                tokio::spawn(async move {
                                    let outcome = handle.await.ok().flatten();
                                    let _ = done_tx.send((turn_index, outcome));
                                });
                            }
                        }
                    }

                    WsMessage::Close(_) => break,

                    _ => {}
                }
            }
        }
    }

    if let Err(e) = live.stop(session_id).await {
        tracing::warn!(session_id, error = %e, "failed to mark live session stopped");
    }
    connections.write().await.remove(&client_id);
    tracing::info!(session_id, %addr, "live connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_path() {
        assert_eq!(parse_session_path("/live/42/stream"), Some(42));
        assert_eq!(parse_session_path("/live/42/stream/"), Some(42));
        assert_eq!(parse_session_path("/live/abc/stream"), None);
        assert_eq!(parse_session_path("/live/42"), None);
        assert_eq!(parse_session_path("/api/live/42/stream"), None);
    }
}
