use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Connection status shown by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ready,
    Connecting,
    Connected,
    MicDenied,
    MicUnavailable,
    ConnectionClosed,
    ConnectionError,
}

/// Events the core emits towards the UI process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Status { status: Status },
    Speaking { speaking: bool },
}

/// Commands the UI process sends to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiCommand {
    Connect,
    Disconnect,
    Toggle,
    StopPlayback,
}

impl UiCommand {
    pub fn parse(msg: &str) -> Option<Self> {
        serde_json::from_str(msg).ok()
    }
}

pub struct StatusBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::Sender<UiCommand>,
    buffer_size: usize,
}

// UI进程和Core进程通过本地UDP通信，端口在配置中指定
impl StatusBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<UiCommand>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!(
            "{}:{}",
            config.status_local_ip, config.status_local_port
        ))
        .await?;
        let target_addr = format!("{}:{}", config.status_remote_ip, config.status_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
            buffer_size: config.status_buffer_size,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match UiCommand::parse(msg) {
                Some(cmd) => {
                    if let Err(e) = self.tx.send(cmd).await {
                        log::error!("Failed to forward UI command: {}", e);
                        break;
                    }
                }
                None => log::debug!("Ignoring UI message: {}", msg),
            }
        }
        Ok(())
    }

    pub async fn send_status(&self, event: &StatusEvent) -> anyhow::Result<()> {
        let msg = serde_json::to_string(event)?;
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_events_serialize_flat() {
        let json = serde_json::to_string(&StatusEvent::Status { status: Status::MicDenied }).unwrap();
        assert_eq!(json, r#"{"type":"status","status":"mic_denied"}"#);
        let json = serde_json::to_string(&StatusEvent::Speaking { speaking: true }).unwrap();
        assert_eq!(json, r#"{"type":"speaking","speaking":true}"#);
    }

    #[test]
    fn ui_commands_parse() {
        assert_eq!(UiCommand::parse(r#"{"type":"toggle"}"#), Some(UiCommand::Toggle));
        assert_eq!(UiCommand::parse(r#"{"type":"connect","extra":1}"#), Some(UiCommand::Connect));
        assert_eq!(
            UiCommand::parse(r#"{"type":"stop_playback"}"#),
            Some(UiCommand::StopPlayback)
        );
        assert_eq!(UiCommand::parse(r#"{"type":"dance"}"#), None);
        assert_eq!(UiCommand::parse("toggle"), None);
    }

    #[tokio::test]
    async fn bridge_forwards_commands_and_status() {
        let ui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ui_port = ui.local_addr().unwrap().port();

        let config = Config {
            status_local_ip: "127.0.0.1".to_string(),
            status_local_port: 0,
            status_remote_ip: "127.0.0.1".to_string(),
            status_remote_port: ui_port,
            ..Config::default()
        };
        let (tx, mut rx) = mpsc::channel(4);
        let bridge = Arc::new(StatusBridge::new(&config, tx).await.unwrap());
        let core_addr = bridge.socket.local_addr().unwrap();

        let runner = bridge.clone();
        tokio::spawn(async move { runner.run().await });

        ui.send_to(br#"{"type":"disconnect"}"#, core_addr).await.unwrap();
        assert_eq!(rx.recv().await, Some(UiCommand::Disconnect));

        bridge
            .send_status(&StatusEvent::Status { status: Status::Connected })
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let (len, _) = ui.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], br#"{"type":"status","status":"connected"}"#);
    }
}
