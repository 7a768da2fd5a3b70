//! Half-duplex gate: mutes capture while any scheduled playback is in flight.
//!
//! The in-flight count and a reset epoch share one atomic word (epoch in the
//! high 32 bits, count in the low 32 bits) so the playback thread can signal
//! completions without locks, and completions scheduled before a reset can
//! never decrement the count of the next session.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

const COUNT_MASK: u64 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Enabled,
    Muted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    SpeakingChanged(bool),
}

/// Handed out for every chunk that starts; returned on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTicket {
    epoch: u32,
}

pub struct DuplexGate {
    state: AtomicU64,
    events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
}

impl DuplexGate {
    pub fn new(events: Option<mpsc::UnboundedSender<PlaybackEvent>>) -> Self {
        Self {
            state: AtomicU64::new(0),
            events,
        }
    }

    pub fn state(&self) -> GateState {
        if self.in_flight() == 0 {
            GateState::Enabled
        } else {
            GateState::Muted
        }
    }

    /// Read by the capture thread before emitting each block.
    pub fn is_capturing(&self) -> bool {
        self.state() == GateState::Enabled
    }

    pub fn in_flight(&self) -> usize {
        (self.state.load(Ordering::Acquire) & COUNT_MASK) as usize
    }

    pub fn on_playback_start(&self) -> PlaybackTicket {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        if prev & COUNT_MASK == 0 {
            log::debug!("Playback started, muting capture");
            self.emit(PlaybackEvent::SpeakingChanged(true));
        }
        PlaybackTicket {
            epoch: (prev >> 32) as u32,
        }
    }

    pub fn on_playback_end(&self, ticket: PlaybackTicket) {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                if (s >> 32) as u32 != ticket.epoch || s & COUNT_MASK == 0 {
                    None
                } else {
                    Some(s - 1)
                }
            });
        if let Ok(prev) = result {
            if prev & COUNT_MASK == 1 {
                log::debug!("Last in-flight chunk finished, capture enabled");
                self.emit(PlaybackEvent::SpeakingChanged(false));
            }
        }
    }

    /// Unmute and forget every in-flight chunk. Completions issued before
    /// the reset are ignored afterwards.
    pub fn reset(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next_epoch = ((current >> 32) as u32).wrapping_add(1) as u64;
            match self.state.compare_exchange_weak(
                current,
                next_epoch << 32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current & COUNT_MASK != 0 {
            self.emit(PlaybackEvent::SpeakingChanged(false));
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        if let Some(tx) = &self.events {
            // Unbounded send never blocks; a closed receiver only means
            // nobody is listening any more.
            let _ = tx.send(event);
        }
    }
}

impl Default for DuplexGate {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_muted_until_last_chunk_completes() {
        let gate = DuplexGate::default();
        assert_eq!(gate.state(), GateState::Enabled);

        let a = gate.on_playback_start();
        let b = gate.on_playback_start();
        let c = gate.on_playback_start();
        assert_eq!(gate.state(), GateState::Muted);

        gate.on_playback_end(a);
        gate.on_playback_end(c);
        assert_eq!(gate.state(), GateState::Muted);

        gate.on_playback_end(b);
        assert_eq!(gate.state(), GateState::Enabled);
    }

    #[test]
    fn extra_completion_does_not_underflow() {
        let gate = DuplexGate::default();
        let t = gate.on_playback_start();
        gate.on_playback_end(t);
        gate.on_playback_end(t);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.is_capturing());
    }

    #[test]
    fn completions_from_before_reset_are_ignored() {
        let gate = DuplexGate::default();
        let stale = gate.on_playback_start();
        gate.reset();
        assert!(gate.is_capturing());

        let fresh = gate.on_playback_start();
        gate.on_playback_end(stale);
        assert_eq!(gate.state(), GateState::Muted);
        gate.on_playback_end(fresh);
        assert_eq!(gate.state(), GateState::Enabled);
    }

    #[test]
    fn speaking_changes_are_emitted_on_edges_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = DuplexGate::new(Some(tx));

        let a = gate.on_playback_start();
        let b = gate.on_playback_start();
        gate.on_playback_end(a);
        gate.on_playback_end(b);
        let c = gate.on_playback_start();
        gate.reset();
        gate.on_playback_end(c);
        gate.reset();

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![
                PlaybackEvent::SpeakingChanged(true),
                PlaybackEvent::SpeakingChanged(false),
                PlaybackEvent::SpeakingChanged(true),
                PlaybackEvent::SpeakingChanged(false),
            ]
        );
    }
}
