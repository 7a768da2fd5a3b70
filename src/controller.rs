use std::sync::Arc;

use tokio::sync::mpsc;

use crate::audio::capture::{CaptureError, CaptureEvent, CaptureHandle, CaptureSource};
use crate::audio::gate::{DuplexGate, PlaybackEvent};
use crate::audio::output::OutputDevice;
use crate::audio::playback::{PlaybackCursor, PlaybackScheduler};
use crate::config::Config;
use crate::net_link::{NetEvent, Session, SessionId, SessionState, TransportError};
use crate::protocol::{self, frame};
use crate::status_bridge::{Status, StatusEvent, UiCommand};

/// Owns everything that lives for the duration of one connection: the
/// session, the capture handle, and the playback timeline. All of it is torn
/// down together, whether the user closes or the remote end goes away.
pub struct CoreController<D: OutputDevice> {
    config: Config,
    session: Option<Session>,
    scheduler: PlaybackScheduler<D>,
    gate: Arc<DuplexGate>,
    capture_source: Box<dyn CaptureSource>,
    capture: Option<CaptureHandle>,
    net_tx: mpsc::Sender<NetEvent>,
    capture_tx: mpsc::Sender<CaptureEvent>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
}

impl<D: OutputDevice> CoreController<D> {
    pub fn new(
        config: Config,
        device: Arc<D>,
        gate: Arc<DuplexGate>,
        capture_source: Box<dyn CaptureSource>,
        net_tx: mpsc::Sender<NetEvent>,
        capture_tx: mpsc::Sender<CaptureEvent>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        let scheduler =
            PlaybackScheduler::new(device, gate.clone(), config.play_time_reset_threshold_ms);
        Self {
            config,
            session: None,
            scheduler,
            gate,
            capture_source,
            capture: None,
            net_tx,
            capture_tx,
            status_tx,
        }
    }

    pub fn gate(&self) -> &Arc<DuplexGate> {
        &self.gate
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.scheduler.cursor()
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|s| s.state())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id())
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_open())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.is_running())
    }

    pub fn emit(&self, status: Status) {
        let _ = self.status_tx.send(StatusEvent::Status { status });
    }

    /// Open a fresh session to the configured endpoint and start the mic.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            log::warn!("Already connected, ignoring connect request");
            return Ok(());
        }

        self.emit(Status::Connecting);
        let mut session = Session::new(self.net_tx.clone());
        if let Err(e) = session.connect(&self.config.ws_url).await {
            log::error!("Connect failed: {}", e);
            self.teardown();
            self.emit(Status::ConnectionError);
            return Err(e);
        }

        // 新会话从干净的时间线开始
        self.scheduler.reset();
        self.gate.reset();
        let id = session.id();
        self.session = Some(session);
        self.emit(Status::Connected);

        match self
            .capture_source
            .start(id, self.gate.clone(), self.capture_tx.clone())
        {
            Ok(handle) => self.capture = Some(handle),
            Err(e) => {
                // 麦克风失败不影响播放，会话保持连接
                log::error!("{}", e);
                self.emit(match e {
                    CaptureError::PermissionDenied(_) => Status::MicDenied,
                    CaptureError::DeviceUnavailable(_) => Status::MicUnavailable,
                });
            }
        }
        Ok(())
    }

    /// User initiated close. Idempotent.
    pub fn close(&mut self) {
        let had_session = self.session.is_some();
        self.teardown();
        if had_session {
            log::info!("Disconnected");
            self.emit(Status::Ready);
        }
    }

    /// Cut off everything still playing and reopen the mic. The session
    /// stays up.
    pub fn stop_playback(&mut self) {
        log::info!("Stopping playback");
        self.scheduler.stop(true);
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.scheduler.reset();
        self.gate.reset();
    }

    pub fn handle_net_event(&mut self, event: NetEvent) {
        let session = event.session();
        if self.session_id() != Some(session) {
            log::debug!("Discarding event from stale session {}", session);
            return;
        }

        match event {
            NetEvent::Binary { data, .. } => self.process_server_frame(&data),
            NetEvent::Text { text, .. } => {
                log::info!("Received Text from Server: {}", text);
            }
            NetEvent::Closed { error, .. } => {
                self.teardown();
                let status = match error {
                    None | Some(TransportError::RemoteClosed(_)) => Status::ConnectionClosed,
                    Some(_) => Status::ConnectionError,
                };
                self.emit(status);
            }
        }
    }

    fn process_server_frame(&mut self, data: &[u8]) {
        let frame = match protocol::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping {} byte message: {}", data.len(), e);
                return;
            }
        };

        match frame.kind {
            Some(frame::Kind::Audio(audio)) => {
                let payload = protocol::AudioPayload::from(audio);
                if let Some(chunk) = self.scheduler.enqueue(&payload) {
                    log::trace!("Scheduled {} frames at {}", chunk.duration, chunk.start);
                }
            }
            Some(frame::Kind::Text(t)) => log::info!("Text: {}", t.text),
            Some(frame::Kind::Transcription(t)) => {
                log::info!("Transcription ({}): {}", t.user_id, t.text)
            }
            Some(frame::Kind::Message(m)) => log::info!("Message: {}", m.data),
            None => log::debug!("Empty frame"),
        }
    }

    pub fn handle_capture_event(&mut self, event: CaptureEvent) {
        let CaptureEvent::Block(block) = event;
        // 旧会话录到的音频块可能仍在队列里，不能发给新会话
        let Some(session) = self.session.as_ref().filter(|s| s.id() == block.session) else {
            log::debug!("Discarding mic block from session {}", block.session);
            return;
        };
        if let Err(e) = session.send(protocol::encode(block.into_payload())) {
            log::debug!("Dropping mic block: {}", e);
        }
    }

    pub fn handle_playback_event(&mut self, event: PlaybackEvent) {
        let PlaybackEvent::SpeakingChanged(speaking) = event;
        log::debug!("Speaking: {}", speaking);
        let _ = self.status_tx.send(StatusEvent::Speaking { speaking });
    }

    pub async fn handle_ui_command(&mut self, cmd: UiCommand) {
        log::info!("UI command: {:?}", cmd);
        match cmd {
            UiCommand::Connect => {
                let _ = self.connect().await;
            }
            UiCommand::Disconnect => self.close(),
            UiCommand::StopPlayback => self.stop_playback(),
            UiCommand::Toggle => {
                if self.session.is_some() {
                    self.close();
                } else {
                    let _ = self.connect().await;
                }
            }
        }
    }
}

impl<D: OutputDevice> Drop for CoreController<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
