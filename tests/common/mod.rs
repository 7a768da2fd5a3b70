pub use voicebot_linux_rs::audio::output::{DeviceTime, OnEnded, OutputDevice};

#[allow(dead_code)]
#[path = "../../src/audio/manual_clock.rs"]
mod manual_clock;

pub use manual_clock::ManualClockOutput;
