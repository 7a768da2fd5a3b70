//! audio - capture, playback and half-duplex gating
//!
//! Uses ALSA for device I/O and SpeexDSP for echo cancellation, noise
//! suppression, AGC and resampling. Device I/O runs on dedicated threads;
//! everything else is driven from the controller's event loop.

mod alsa_device;
pub mod capture;
pub mod gate;
#[cfg(test)]
pub(crate) mod manual_clock;
pub mod output;
pub mod pcm;
pub mod playback;
pub mod speex;

pub use capture::{AlsaCapture, CaptureError, CaptureEvent, CaptureHandle, CaptureSource};
pub use gate::{DuplexGate, GateState, PlaybackEvent};
pub use output::{AlsaOutput, DeviceTime, OnEnded, OutputDevice};
pub use playback::{PlaybackCursor, PlaybackScheduler};
