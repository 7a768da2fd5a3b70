//! Real-time duplex voice client: streams the microphone to a WebSocket
//! endpoint as protobuf frames and plays the audio frames that come back.

pub mod audio;
pub mod config;
pub mod controller;
pub mod net_link;
pub mod protocol;
pub mod status_bridge;
