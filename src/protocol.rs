//! Wire frames exchanged with the voice endpoint.
//!
//! Frames are Protocol Buffers messages. The structs below carry the same
//! field numbers as the server's `frames.proto`, so decoders stay compatible
//! when the server adds new frame kinds: unknown fields are skipped by prost.

use prost::Message;
use thiserror::Error;

/// Sample rate used for every audio frame within a session.
pub const SAMPLE_RATE: u32 = 16000;
/// Mono only.
pub const NUM_CHANNELS: u32 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct TextFrame {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub text: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AudioRawFrame {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub audio: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub sample_rate: u32,
    #[prost(uint32, tag = "5")]
    pub num_channels: u32,
    #[prost(uint64, optional, tag = "6")]
    pub pts: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TranscriptionFrame {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub text: String,
    #[prost(string, tag = "4")]
    pub user_id: String,
    #[prost(string, tag = "5")]
    pub timestamp: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct MessageFrame {
    #[prost(string, tag = "1")]
    pub data: String,
}

/// Top level message. Exactly one variant is populated.
#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(oneof = "frame::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Text(super::TextFrame),
        #[prost(message, tag = "2")]
        Audio(super::AudioRawFrame),
        #[prost(message, tag = "3")]
        Transcription(super::TranscriptionFrame),
        #[prost(message, tag = "4")]
        Message(super::MessageFrame),
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] prost::DecodeError),
}

/// Raw PCM audio with its format, as carried by an [`AudioRawFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u32,
}

impl AudioPayload {
    /// Build a mono payload from 16-bit samples, little-endian on the wire.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        Self {
            bytes: crate::audio::pcm::s16_to_le_bytes(samples),
            sample_rate,
            channels: NUM_CHANNELS,
        }
    }
}

impl From<AudioRawFrame> for AudioPayload {
    fn from(frame: AudioRawFrame) -> Self {
        Self {
            bytes: frame.audio,
            sample_rate: frame.sample_rate,
            channels: frame.num_channels,
        }
    }
}

impl Frame {
    pub fn audio(payload: AudioPayload) -> Self {
        Self {
            kind: Some(frame::Kind::Audio(AudioRawFrame {
                audio: payload.bytes,
                sample_rate: payload.sample_rate,
                num_channels: payload.channels,
                ..Default::default()
            })),
        }
    }

    /// Take the audio payload out of the frame, if this is an audio frame.
    pub fn into_audio(self) -> Option<AudioPayload> {
        match self.kind {
            Some(frame::Kind::Audio(audio)) => Some(audio.into()),
            _ => None,
        }
    }
}

pub fn encode(payload: AudioPayload) -> Vec<u8> {
    Frame::audio(payload).encode_to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    Ok(Frame::decode(bytes)?)
}
