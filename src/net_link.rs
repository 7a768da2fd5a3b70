use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;
use uuid::Uuid;

// 命令通道容量：约 3 秒的 32ms 音频块
const COMMAND_CAPACITY: usize = 100;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Idle,
            1 => SessionState::Connecting,
            2 => SessionState::Open,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("remote closed the connection: {0}")]
    RemoteClosed(String),
}

/// Everything the link reports back to the controller, tagged with the
/// session that produced it.
#[derive(Debug)]
pub enum NetEvent {
    Binary { session: SessionId, data: Vec<u8> },
    Text { session: SessionId, text: String },
    Closed { session: SessionId, error: Option<TransportError> },
}

impl NetEvent {
    pub fn session(&self) -> SessionId {
        match self {
            NetEvent::Binary { session, .. }
            | NetEvent::Text { session, .. }
            | NetEvent::Closed { session, .. } => *session,
        }
    }
}

#[derive(Debug)]
enum NetCommand {
    SendBinary(Vec<u8>),
    Close,
}

/// One WebSocket connection. Sessions are single use: once closed, a new
/// one has to be created to reconnect.
pub struct Session {
    id: SessionId,
    state: Arc<AtomicU8>,
    events: mpsc::Sender<NetEvent>,
    cmd_tx: Option<mpsc::Sender<NetCommand>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(events: mpsc::Sender<NetEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(AtomicU8::new(SessionState::Idle as u8)),
            events,
            cmd_tx: None,
            task: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Open the connection. Returns once the handshake has completed.
    pub async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        if self.state() != SessionState::Idle {
            return Err(TransportError::ConnectFailed(format!(
                "session is {:?}, not Idle",
                self.state()
            )));
        }
        self.set_state(SessionState::Connecting);

        let url = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(e) => {
                self.set_state(SessionState::Closed);
                return Err(TransportError::ConnectFailed(format!("{}: {}", endpoint, e)));
            }
        };

        log::info!("Connecting to {}...", url);
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.set_state(SessionState::Closed);
                return Err(TransportError::ConnectFailed(e.to_string()));
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        self.cmd_tx = Some(cmd_tx);
        self.set_state(SessionState::Open);
        log::info!("Session {} open", self.id);

        self.task = Some(tokio::spawn(run_link(
            self.id,
            self.state.clone(),
            ws_stream,
            cmd_rx,
            self.events.clone(),
        )));
        Ok(())
    }

    /// Queue one binary message. Never waits; nothing is queued unless the
    /// session is open.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let Some(cmd_tx) = &self.cmd_tx else {
            return Err(TransportError::NotConnected);
        };
        match cmd_tx.try_send(NetCommand::SendBinary(bytes)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Send queue full, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::NotConnected),
        }
    }

    /// Close the connection. Idempotent and never waits.
    pub fn close(&mut self) {
        match self.state() {
            SessionState::Idle => self.set_state(SessionState::Closed),
            SessionState::Connecting => self.set_state(SessionState::Closing),
            SessionState::Open => {
                self.set_state(SessionState::Closing);
                let delivered = self
                    .cmd_tx
                    .as_ref()
                    .map(|tx| tx.try_send(NetCommand::Close).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    // Link task is gone or backed up; stop it directly.
                    if let Some(task) = self.task.take() {
                        task.abort();
                    }
                    self.set_state(SessionState::Closed);
                }
            }
            SessionState::Closing | SessionState::Closed => {}
        }
        self.cmd_tx = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

// 主循环，处理读取和写入
async fn run_link<S>(
    session: SessionId,
    state: Arc<AtomicU8>,
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut cmd_rx: mpsc::Receiver<NetCommand>,
    events: mpsc::Sender<NetEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    let error = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let event = NetEvent::Binary { session, data: data.to_vec() };
                        if events.send(event).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        let event = NetEvent::Text { session, text: text.to_string() };
                        if events.send(event).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "no close frame".to_string());
                        break Some(TransportError::RemoteClosed(reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(TransportError::RemoteClosed(e.to_string())),
                    None => break Some(TransportError::RemoteClosed("stream ended".to_string())),
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NetCommand::SendBinary(data)) => {
                        if let Err(e) = write.send(Message::Binary(Bytes::from(data))).await {
                            break Some(TransportError::RemoteClosed(e.to_string()));
                        }
                    }
                    Some(NetCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break None;
                    }
                }
            }
        }
    };

    state.store(SessionState::Closed as u8, Ordering::Release);
    match &error {
        Some(e) => log::warn!("Session {} closed: {}", session, e),
        None => log::info!("Session {} closed", session),
    }
    let _ = events.send(NetEvent::Closed { session, error }).await;
}
