//! Playback continuity scheduler.
//!
//! Inbound chunks are laid end to end on a virtual timeline measured in
//! output device frames. While chunks keep arriving before the timeline
//! catches up with the device clock, playback is gap free and never
//! overlaps. When arrivals stall for longer than the reset threshold the
//! timeline jumps to the device clock instead of replaying a stale backlog.

use std::sync::Arc;

use super::gate::DuplexGate;
use super::output::{DeviceTime, OutputDevice};
use super::pcm;
use super::speex::Resampler;
use crate::protocol::AudioPayload;

/// Default arrival gap that forces the timeline back to the device clock.
pub const PLAY_TIME_RESET_THRESHOLD_MS: f64 = 1.0;

/// Payload sample rates accepted for playback.
pub const MIN_PAYLOAD_RATE: u32 = 8000;
pub const MAX_PAYLOAD_RATE: u32 = 48000;
/// Longest single chunk accepted, in milliseconds.
pub const MAX_CHUNK_MS: u64 = 10_000;
/// Most channels accepted in one payload.
pub const MAX_PAYLOAD_CHANNELS: u32 = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackCursor {
    /// Device time at which the next chunk starts. Zero until the first
    /// chunk of a session is scheduled.
    pub virtual_clock: DeviceTime,
    /// Device time at which the previous chunk was scheduled.
    pub last_arrival: DeviceTime,
}

impl PlaybackCursor {
    pub fn is_reset(&self) -> bool {
        self.virtual_clock == 0
    }
}

/// Where a chunk landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub start: DeviceTime,
    pub duration: u64,
}

pub struct PlaybackScheduler<D: OutputDevice> {
    device: Arc<D>,
    gate: Arc<DuplexGate>,
    cursor: PlaybackCursor,
    reset_threshold: u64,
    resampler: Option<Resampler>,
}

impl<D: OutputDevice> PlaybackScheduler<D> {
    pub fn new(device: Arc<D>, gate: Arc<DuplexGate>, reset_threshold_ms: f64) -> Self {
        let reset_threshold =
            (reset_threshold_ms.max(0.0) * device.sample_rate() as f64 / 1000.0).round() as u64;
        Self {
            device,
            gate,
            cursor: PlaybackCursor::default(),
            reset_threshold,
            resampler: None,
        }
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    /// Schedule one inbound chunk. Payloads that cannot be played (empty,
    /// odd byte count, rate or channel count out of range, longer than
    /// [`MAX_CHUNK_MS`]) are dropped and leave the cursor untouched.
    pub fn enqueue(&mut self, payload: &AudioPayload) -> Option<ScheduledChunk> {
        let buffer = match self.to_playable(payload) {
            Some(buffer) if !buffer.is_empty() => buffer,
            _ => {
                log::debug!(
                    "Dropping unplayable chunk: {} bytes, {}Hz, {}ch",
                    payload.bytes.len(),
                    payload.sample_rate,
                    payload.channels
                );
                return None;
            }
        };

        let now = self.device.current_time();
        let gap = now.saturating_sub(self.cursor.last_arrival);
        if self.cursor.is_reset() || gap > self.reset_threshold {
            self.cursor.virtual_clock = now;
        }

        let start = self.cursor.virtual_clock;
        let duration = buffer.len() as u64;

        let ticket = self.gate.on_playback_start();
        let gate = self.gate.clone();
        self.device
            .schedule(buffer, start, Box::new(move || gate.on_playback_end(ticket)));

        self.cursor.virtual_clock = start + duration;
        self.cursor.last_arrival = now;

        Some(ScheduledChunk { start, duration })
    }

    /// Forget the timeline. Chunks already handed to the device keep playing.
    pub fn reset(&mut self) {
        self.cursor = PlaybackCursor::default();
        self.resampler = None;
    }

    /// Reset the timeline; with `hard`, also silence every chunk still
    /// scheduled on the device and unmute capture right away.
    pub fn stop(&mut self, hard: bool) {
        if hard {
            self.device.cancel_all();
            self.gate.reset();
        }
        self.reset();
    }

    fn to_playable(&mut self, payload: &AudioPayload) -> Option<Vec<f32>> {
        if !(MIN_PAYLOAD_RATE..=MAX_PAYLOAD_RATE).contains(&payload.sample_rate)
            || !(1..=MAX_PAYLOAD_CHANNELS).contains(&payload.channels)
        {
            return None;
        }
        // 先按字节数检查时长，避免为超长数据分配内存
        let frames = (payload.bytes.len() / 2 / payload.channels as usize) as u64;
        if frames * 1000 > MAX_CHUNK_MS * payload.sample_rate as u64 {
            return None;
        }
        let samples = pcm::le_bytes_to_s16(&payload.bytes)?;
        let channels = payload.channels as usize;
        if samples.len() % channels != 0 {
            return None;
        }
        let mono = pcm::downmix_to_mono(&samples, channels);

        let device_rate = self.device.sample_rate();
        let mono = if payload.sample_rate == device_rate {
            mono
        } else {
            self.resample(&mono, payload.sample_rate, device_rate)?
        };

        Some(mono.into_iter().map(pcm::s16_to_float).collect())
    }

    fn resample(&mut self, input: &[i16], from: u32, to: u32) -> Option<Vec<i16>> {
        if self.resampler.as_ref().map(|r| r.rates()) != Some((from, to)) {
            match Resampler::new(1, from, to) {
                Ok(r) => self.resampler = Some(r),
                Err(e) => {
                    log::error!("Cannot resample {}Hz -> {}Hz: {}", from, to, e);
                    return None;
                }
            }
        }
        let resampler = self.resampler.as_mut()?;
        match resampler.process_all(input) {
            Ok(out) => Some(out),
            Err(e) => {
                log::error!("Resample failed: {}", e);
                None
            }
        }
    }
}
