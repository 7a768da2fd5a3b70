//! Microphone capture pipeline.
//!
//! Recording thread: ALSA capture (float) → mono → fixed-size blocks →
//! PCM encode → echo cancel / denoise / AGC → gate check → `CaptureEvent`.
//!
//! Runs on a std::thread, not a tokio task, so device reads never contend
//! with the network loop. Blocks leave the thread through `try_send`; a full
//! channel drops the block rather than stall the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::mpsc;

use super::alsa_device;
use super::gate::DuplexGate;
use super::output::SharedEcho;
use super::pcm;
use super::speex::Preprocessor;
use crate::config::Config;
use crate::net_link::SessionId;
use crate::protocol::AudioPayload;

const NOISE_SUPPRESS_DB: i32 = -25;
const AGC_LEVEL: f32 = 24000.0;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u32,
    pub block_size: usize,
    pub auto_gain_control: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl CaptureConstraints {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            block_size: config.block_size,
            auto_gain_control: config.auto_gain_control,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One block of encoded microphone samples, tagged with the session that
/// was open when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    pub session: SessionId,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn into_payload(self) -> AudioPayload {
        AudioPayload::from_samples(&self.samples, self.sample_rate)
    }
}

#[derive(Debug)]
pub enum CaptureEvent {
    Block(AudioBlock),
}

/// Something that can open the microphone and feed blocks to `tx`.
pub trait CaptureSource: Send {
    fn start(
        &self,
        session: SessionId,
        gate: Arc<DuplexGate>,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureHandle, CaptureError>;
}

/// Keeps the recording thread alive. Stopping (or dropping) releases the device.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Run `body` on a named thread; it should return once the flag it is
    /// given turns false.
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = running.clone();
            thread::Builder::new().name(name.into()).spawn(move || {
                body(&running);
                running.store(false, Ordering::SeqCst);
            })?
        };
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Signal the recording thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.thread.take() {
            if h.thread().id() == thread::current().id() {
                return;
            }
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.thread.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ======================== Block pipeline ========================

/// The device independent half of capture: blocking, processing, gating.
pub struct CapturePipeline {
    session: SessionId,
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    preprocessor: Option<Preprocessor>,
    echo: Option<SharedEcho>,
    gate: Arc<DuplexGate>,
    tx: mpsc::Sender<CaptureEvent>,
}

/// What happened to a completed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Forwarded,
    Muted,
    Dropped,
    Disconnected,
}

impl CapturePipeline {
    pub fn new(
        session: SessionId,
        constraints: &CaptureConstraints,
        sample_rate: u32,
        echo: Option<SharedEcho>,
        gate: Arc<DuplexGate>,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> anyhow::Result<Self> {
        let block_size = constraints.block_size.max(1);
        let preprocessor = if constraints.auto_gain_control || constraints.noise_suppression {
            let mut pp = Preprocessor::new(block_size, sample_rate)?;
            pp.set_denoise(constraints.noise_suppression);
            if constraints.noise_suppression {
                pp.set_noise_suppress(NOISE_SUPPRESS_DB);
            }
            pp.set_agc(constraints.auto_gain_control);
            if constraints.auto_gain_control {
                pp.set_agc_level(AGC_LEVEL);
            }
            Some(pp)
        } else {
            None
        };
        let echo = if constraints.echo_cancellation { echo } else { None };

        Ok(Self {
            session,
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
            preprocessor,
            echo,
            gate,
            tx,
        })
    }

    /// Feed mono float samples; every completed block is processed in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<BlockOutcome> {
        self.pending.extend_from_slice(samples);
        let mut outcomes = Vec::new();
        while self.pending.len() >= self.block_size {
            let mut block = pcm::encode_f32(&self.pending[..self.block_size]);
            self.pending.drain(..self.block_size);
            outcomes.push(self.process_block(&mut block));
        }
        outcomes
    }

    fn process_block(&mut self, block: &mut Vec<i16>) -> BlockOutcome {
        if let Some(ec) = &self.echo {
            // Keep the canceller fed even while muted so both ends stay aligned.
            if let Ok(mut ec) = ec.try_lock() {
                ec.capture(block);
            }
        }
        if let Some(pp) = &mut self.preprocessor {
            pp.process(block);
        }

        if !self.gate.is_capturing() {
            return BlockOutcome::Muted;
        }

        let event = CaptureEvent::Block(AudioBlock {
            session: self.session,
            samples: std::mem::take(block),
            sample_rate: self.sample_rate,
        });
        match self.tx.try_send(event) {
            Ok(()) => BlockOutcome::Forwarded,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Capture channel full, dropping block");
                BlockOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => BlockOutcome::Disconnected,
        }
    }
}

// ======================== ALSA capture ========================

/// Capture from an ALSA device.
pub struct AlsaCapture {
    device: String,
    constraints: CaptureConstraints,
    echo: Option<SharedEcho>,
}

impl AlsaCapture {
    pub fn new(config: &Config, echo: Option<SharedEcho>) -> Self {
        Self {
            device: config.capture_device.clone(),
            constraints: CaptureConstraints::from_config(config),
            echo,
        }
    }
}

impl CaptureSource for AlsaCapture {
    fn start(
        &self,
        session: SessionId,
        gate: Arc<DuplexGate>,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureHandle, CaptureError> {
        start(session, &self.device, &self.constraints, self.echo.clone(), gate, tx)
    }
}

/// Open the capture device and start the recording thread.
pub fn start(
    session: SessionId,
    device: &str,
    constraints: &CaptureConstraints,
    echo: Option<SharedEcho>,
    gate: Arc<DuplexGate>,
    tx: mpsc::Sender<CaptureEvent>,
) -> Result<CaptureHandle, CaptureError> {
    let (pcm, params) = alsa_device::open_capture(
        device,
        constraints.sample_rate,
        constraints.channels,
        Some(constraints.block_size),
    )
    .map_err(|e| {
        if alsa_device::is_permission_denied(&e) {
            CaptureError::PermissionDenied(format!("{:#}", e))
        } else {
            CaptureError::DeviceUnavailable(format!("{:#}", e))
        }
    })?;

    if params.sample_rate != constraints.sample_rate {
        log::warn!(
            "Capture negotiated {}Hz instead of {}Hz",
            params.sample_rate,
            constraints.sample_rate
        );
    }

    let pipeline = CapturePipeline::new(session, constraints, params.sample_rate, echo, gate, tx)
        .map_err(|e| CaptureError::DeviceUnavailable(format!("{:#}", e)))?;

    CaptureHandle::spawn("audio-record", move |running| {
        if let Err(e) = record_thread(pcm, &params, pipeline, running) {
            log::error!("Recording thread error: {}", e);
        }
    })
    .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))
}

fn record_thread(
    pcm: alsa::PCM,
    params: &alsa_device::AlsaParams,
    mut pipeline: CapturePipeline,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let channels = params.channels.max(1) as usize;
    let period_size = params.period_size.max(1);
    let mut read_buf = vec![0f32; period_size * channels];
    let mut mono = vec![0f32; period_size];

    let io = pcm.io_f32()?;

    log::info!(
        "Recording started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                // Interleaved → mono
                for (i, frame) in read_buf[..frames * channels].chunks_exact(channels).enumerate() {
                    mono[i] = frame.iter().sum::<f32>() / channels as f32;
                }
                let outcomes = pipeline.push(&mono[..frames]);
                if outcomes.contains(&BlockOutcome::Disconnected) {
                    log::warn!("Capture receiver dropped");
                    break;
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SAMPLE_RATE;

    const SESSION: SessionId = SessionId::from_u128(0x5e55_1011);

    fn plain() -> CaptureConstraints {
        CaptureConstraints {
            auto_gain_control: false,
            echo_cancellation: false,
            noise_suppression: false,
            ..CaptureConstraints::default()
        }
    }

    #[test]
    fn samples_are_cut_into_fixed_blocks() {
        let (tx, mut rx) = mpsc::channel(16);
        let gate = Arc::new(DuplexGate::default());
        let mut pipeline = CapturePipeline::new(SESSION, &plain(), SAMPLE_RATE, None, gate, tx).unwrap();

        assert!(pipeline.push(&[0.0; 300]).is_empty());
        assert_eq!(pipeline.push(&[0.0; 800]), vec![BlockOutcome::Forwarded, BlockOutcome::Forwarded]);

        for _ in 0..2 {
            let CaptureEvent::Block(block) = rx.try_recv().unwrap();
            assert_eq!(block.session, SESSION);
            assert_eq!(block.samples.len(), 512);
            assert_eq!(block.sample_rate, SAMPLE_RATE);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn blocks_keep_capture_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let gate = Arc::new(DuplexGate::default());
        let mut pipeline = CapturePipeline::new(SESSION, &plain(), SAMPLE_RATE, None, gate, tx).unwrap();

        let mut input = vec![0.5f32; 512];
        input.extend(vec![-0.5f32; 512]);
        pipeline.push(&input);

        let CaptureEvent::Block(first) = rx.try_recv().unwrap();
        let CaptureEvent::Block(second) = rx.try_recv().unwrap();
        assert!(first.samples.iter().all(|&s| s == 16383));
        assert!(second.samples.iter().all(|&s| s == -16384));
    }

    #[test]
    fn muted_blocks_are_consumed_not_forwarded() {
        let (tx, mut rx) = mpsc::channel(16);
        let gate = Arc::new(DuplexGate::default());
        let mut pipeline =
            CapturePipeline::new(SESSION, &plain(), SAMPLE_RATE, None, gate.clone(), tx).unwrap();

        let ticket = gate.on_playback_start();
        assert_eq!(pipeline.push(&[0.1; 512]), vec![BlockOutcome::Muted]);
        assert!(rx.try_recv().is_err());

        gate.on_playback_end(ticket);
        assert_eq!(pipeline.push(&[0.1; 512]), vec![BlockOutcome::Forwarded]);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let gate = Arc::new(DuplexGate::default());
        let mut pipeline = CapturePipeline::new(SESSION, &plain(), SAMPLE_RATE, None, gate, tx).unwrap();
        assert_eq!(
            pipeline.push(&[0.0; 1024]),
            vec![BlockOutcome::Forwarded, BlockOutcome::Dropped]
        );
    }

    #[test]
    fn closed_channel_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let gate = Arc::new(DuplexGate::default());
        let mut pipeline = CapturePipeline::new(SESSION, &plain(), SAMPLE_RATE, None, gate, tx).unwrap();
        assert_eq!(pipeline.push(&[0.0; 512]), vec![BlockOutcome::Disconnected]);
    }

    #[test]
    fn silent_block_becomes_1024_zero_bytes() {
        let block = AudioBlock { session: SESSION, samples: vec![0; 512], sample_rate: SAMPLE_RATE };
        let payload = block.into_payload();
        assert_eq!(payload.bytes, vec![0u8; 1024]);
        assert_eq!(payload.channels, 1);
    }

    #[test]
    fn stopping_a_handle_twice_is_harmless() {
        let mut handle = CaptureHandle::spawn("test-capture", |running| {
            while running.load(Ordering::SeqCst) {
                thread::sleep(std::time::Duration::from_millis(1));
            }
        })
        .unwrap();
        assert!(handle.is_running());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }
}
