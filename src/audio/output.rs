//! Output devices that accept buffers scheduled at an explicit start time.
//!
//! Device time is counted in frames at the device sample rate. The ALSA
//! output renders on its own OS thread: every period it mixes all buffers
//! that overlap the period, writes the result, advances the clock, and fires
//! the completion of each buffer whose last sample went out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Result;

use super::alsa_device;
use super::pcm;
use super::speex::EchoCanceller;
use crate::config::Config;

/// Frames elapsed on the output device.
pub type DeviceTime = u64;

pub type OnEnded = Box<dyn FnOnce() + Send + 'static>;

/// Echo canceller shared by the output (far end) and capture (near end) threads.
pub type SharedEcho = Arc<Mutex<EchoCanceller>>;

pub trait OutputDevice: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn current_time(&self) -> DeviceTime;

    /// Play mono `samples` starting at `start_at`. A start time that has
    /// already passed plays immediately. `on_ended` runs once, after the
    /// last sample has been rendered.
    fn schedule(&self, samples: Vec<f32>, start_at: DeviceTime, on_ended: OnEnded);

    /// Silence everything scheduled so far. Completions of cancelled
    /// buffers never run.
    fn cancel_all(&self);
}

// ======================== Mixer ========================

struct ScheduledBuffer {
    samples: Vec<f32>,
    start: DeviceTime,
    pos: usize,
    on_ended: Option<OnEnded>,
}

impl ScheduledBuffer {
    fn render(&mut self, period_start: DeviceTime, mix: &mut [f32]) {
        let period_end = period_start + mix.len() as u64;
        if self.start >= period_end {
            return;
        }
        let offset = self.start.saturating_sub(period_start) as usize;
        let n = (mix.len() - offset).min(self.samples.len() - self.pos);
        for (out, s) in mix[offset..offset + n]
            .iter_mut()
            .zip(&self.samples[self.pos..self.pos + n])
        {
            *out += *s;
        }
        self.pos += n;
    }

    fn is_finished(&self) -> bool {
        self.pos >= self.samples.len()
    }
}

/// Sums every scheduled buffer into consecutive periods.
#[derive(Default)]
pub struct Mixer {
    active: Vec<ScheduledBuffer>,
}

impl Mixer {
    pub fn add(&mut self, samples: Vec<f32>, start: DeviceTime, on_ended: OnEnded) {
        self.active.push(ScheduledBuffer {
            samples,
            start,
            pos: 0,
            on_ended: Some(on_ended),
        });
    }

    /// Drop every buffer along with its completion.
    pub fn clear(&mut self) {
        self.active.clear();
    }

    /// Render the period starting at `period_start` into `mix` (overwritten)
    /// and return the completions of buffers that finished within it.
    pub fn render(&mut self, period_start: DeviceTime, mix: &mut [f32]) -> Vec<OnEnded> {
        mix.fill(0.0);
        for buffer in &mut self.active {
            buffer.render(period_start, mix);
        }
        let mut ended = Vec::new();
        self.active.retain_mut(|buffer| {
            if buffer.is_finished() {
                if let Some(cb) = buffer.on_ended.take() {
                    ended.push(cb);
                }
                false
            } else {
                true
            }
        });
        ended
    }
}

// ======================== ALSA output ========================

enum OutputCommand {
    Schedule {
        samples: Vec<f32>,
        start: DeviceTime,
        on_ended: OnEnded,
    },
    CancelAll,
}

/// ALSA playback device driven by a dedicated render thread.
pub struct AlsaOutput {
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    tx: std_mpsc::Sender<OutputCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AlsaOutput {
    /// Open the playback device and start rendering silence.
    ///
    /// When `echo` is given and the device runs at the capture rate, every
    /// rendered period is fed to it as the far-end reference.
    pub fn start(config: &Config, echo: Option<SharedEcho>) -> Result<Self> {
        let period_size = if config.playback_period_size > 0 {
            Some(config.playback_period_size)
        } else {
            None
        };
        let (pcm, params) = alsa_device::open_playback(
            &config.playback_device,
            config.sample_rate,
            1,
            period_size,
        )?;

        let echo = match echo {
            Some(ec) if params.sample_rate == config.sample_rate => Some(ec),
            Some(_) => {
                log::warn!(
                    "Playback runs at {}Hz, capture at {}Hz; echo reference disabled",
                    params.sample_rate,
                    config.sample_rate
                );
                None
            }
            None => None,
        };

        let clock = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = std_mpsc::channel();

        let handle = {
            let clock = clock.clone();
            let running = running.clone();
            let params = params.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(pcm, &params, rx, &clock, &running, echo) {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        Ok(Self {
            sample_rate: params.sample_rate,
            clock,
            running,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop rendering and release the device. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl OutputDevice for AlsaOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> DeviceTime {
        self.clock.load(Ordering::Acquire)
    }

    fn schedule(&self, samples: Vec<f32>, start_at: DeviceTime, on_ended: OnEnded) {
        let cmd = OutputCommand::Schedule {
            samples,
            start: start_at,
            on_ended,
        };
        if let Err(std_mpsc::SendError(cmd)) = self.tx.send(cmd) {
            log::warn!("Playback thread gone, dropping scheduled buffer");
            if let OutputCommand::Schedule { on_ended, .. } = cmd {
                on_ended();
            }
        }
    }

    fn cancel_all(&self) {
        if self.tx.send(OutputCommand::CancelAll).is_err() {
            log::warn!("Playback thread gone, nothing to cancel");
        }
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play_thread(
    pcm: alsa::PCM,
    params: &alsa_device::AlsaParams,
    rx: std_mpsc::Receiver<OutputCommand>,
    clock: &AtomicU64,
    running: &AtomicBool,
    echo: Option<SharedEcho>,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let period = params.period_size.max(1);
    let channels = params.channels.max(1) as usize;

    let mut mixer = Mixer::default();
    let mut mix = vec![0f32; period];
    let mut out = vec![0i16; period * channels];
    let mut reference: Vec<i16> = Vec::with_capacity(period * 2);

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period,
    );

    while running.load(Ordering::Relaxed) {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                OutputCommand::Schedule {
                    samples,
                    start,
                    on_ended,
                } => mixer.add(samples, start, on_ended),
                OutputCommand::CancelAll => {
                    log::debug!("Cancelling scheduled playback");
                    mixer.clear();
                }
            }
        }

        let period_start = clock.load(Ordering::Acquire);
        let ended = mixer.render(period_start, &mut mix);

        let mono = pcm::encode_f32(&mix);
        for (frame, &s) in out.chunks_exact_mut(channels).zip(&mono) {
            frame.fill(s);
        }

        // Write with a retry loop to handle short writes and XRUN recovery.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            let offset = frames_written * channels;
            match io.writei(&out[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        return Err(e2.into());
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }

        clock.store(period_start + period as u64, Ordering::Release);
        for cb in ended {
            cb();
        }

        if let Some(ec) = &echo {
            reference.extend_from_slice(&mono);
            if let Ok(mut ec) = ec.try_lock() {
                let fs = ec.frame_size();
                while reference.len() >= fs {
                    ec.playback(&reference[..fs]);
                    reference.drain(..fs);
                }
            } else if reference.len() > period * 8 {
                // 录音线程长时间占用锁，丢弃过期的参考信号
                reference.clear();
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::manual_clock::ManualClockOutput;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> OnEnded) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let make = move || -> OnEnded {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn back_to_back_buffers_fill_periods_without_gaps() {
        let (ended, on_ended) = counter();
        let mut mixer = Mixer::default();
        mixer.add(vec![0.25; 6], 0, on_ended());
        mixer.add(vec![0.5; 6], 6, on_ended());

        let mut mix = vec![0.0; 4];
        assert!(mixer.render(0, &mut mix).is_empty());
        assert_eq!(mix, vec![0.25; 4]);

        for cb in mixer.render(4, &mut mix) {
            cb();
        }
        assert_eq!(mix, vec![0.25, 0.25, 0.5, 0.5]);
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        for cb in mixer.render(8, &mut mix) {
            cb();
        }
        assert_eq!(mix, vec![0.5, 0.5, 0.5, 0.5]);
        assert_eq!(ended.load(Ordering::SeqCst), 2);
        assert!(mixer.active.is_empty());
    }

    #[test]
    fn overlapping_buffers_are_summed() {
        let (_, on_ended) = counter();
        let mut mixer = Mixer::default();
        mixer.add(vec![0.25; 4], 0, on_ended());
        mixer.add(vec![0.5; 2], 1, on_ended());

        let mut mix = vec![0.0; 4];
        let _ = mixer.render(0, &mut mix);
        assert_eq!(mix, vec![0.25, 0.75, 0.75, 0.25]);
    }

    #[test]
    fn late_buffer_plays_from_the_current_period() {
        let (ended, on_ended) = counter();
        let mut mixer = Mixer::default();
        mixer.add(vec![1.0, 0.5], 3, on_ended());

        let mut mix = vec![0.0; 4];
        for cb in mixer.render(100, &mut mix) {
            cb();
        }
        assert_eq!(mix, vec![1.0, 0.5, 0.0, 0.0]);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn future_buffer_waits_for_its_period() {
        let (_, on_ended) = counter();
        let mut mixer = Mixer::default();
        mixer.add(vec![1.0; 2], 10, on_ended());

        let mut mix = vec![0.0; 4];
        let _ = mixer.render(0, &mut mix);
        assert_eq!(mix, vec![0.0; 4]);
        let _ = mixer.render(8, &mut mix);
        assert_eq!(mix, vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn clear_silences_buffers_and_drops_completions() {
        let (ended, on_ended) = counter();
        let mut mixer = Mixer::default();
        mixer.add(vec![0.5; 8], 0, on_ended());
        mixer.add(vec![0.5; 8], 8, on_ended());

        let mut mix = vec![0.0; 4];
        let _ = mixer.render(0, &mut mix);
        mixer.clear();

        for start in [4, 8, 12] {
            assert!(mixer.render(start, &mut mix).is_empty());
            assert_eq!(mix, vec![0.0; 4]);
        }
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn manual_clock_cancel_drops_pending_completions() {
        let (ended, on_ended) = counter();
        let out = ManualClockOutput::new(16000);
        out.schedule(vec![0.0; 100], 0, on_ended());
        out.schedule(vec![0.0; 100], 100, on_ended());
        out.advance_to(100);
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        out.cancel_all();
        assert_eq!(out.in_flight(), 0);
        out.advance_by(1000);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_clock_fires_completions_at_buffer_end() {
        let (ended, on_ended) = counter();
        let out = ManualClockOutput::new(16000);
        out.schedule(vec![0.0; 100], 0, on_ended());
        out.schedule(vec![0.0; 100], 100, on_ended());

        out.advance_to(99);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        out.advance_to(100);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        out.advance_by(100);
        assert_eq!(ended.load(Ordering::SeqCst), 2);
        assert_eq!(out.scheduled(), vec![(0, 100), (100, 100)]);
        assert_eq!(out.in_flight(), 0);
    }
}
