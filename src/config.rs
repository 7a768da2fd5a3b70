use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    // 网络配置
    pub ws_url: String,
    pub auto_connect: bool,

    // 音频配置
    pub capture_device: String,
    pub playback_device: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub block_size: usize,
    pub auto_gain_control: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub play_time_reset_threshold_ms: f64,
    pub playback_period_size: usize,

    // 状态桥配置（与 UI 进程通过本地 UDP 通信）
    pub status_local_ip: String,
    pub status_local_port: u16,
    pub status_remote_ip: String,
    pub status_remote_port: u16,
    pub status_buffer_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            auto_connect: env!("AUTO_CONNECT")
                .parse()
                .context("Failed to parse AUTO_CONNECT")?,

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            sample_rate: env!("AUDIO_SAMPLE_RATE")
                .parse()
                .context("Failed to parse AUDIO_SAMPLE_RATE")?,
            channels: env!("AUDIO_CHANNELS")
                .parse()
                .context("Failed to parse AUDIO_CHANNELS")?,
            block_size: env!("AUDIO_BLOCK_SIZE")
                .parse()
                .context("Failed to parse AUDIO_BLOCK_SIZE")?,
            auto_gain_control: env!("AUDIO_AGC")
                .parse()
                .context("Failed to parse AUDIO_AGC")?,
            echo_cancellation: env!("AUDIO_AEC")
                .parse()
                .context("Failed to parse AUDIO_AEC")?,
            noise_suppression: env!("AUDIO_NS")
                .parse()
                .context("Failed to parse AUDIO_NS")?,
            play_time_reset_threshold_ms: env!("PLAY_TIME_RESET_THRESHOLD_MS")
                .parse()
                .context("Failed to parse PLAY_TIME_RESET_THRESHOLD_MS")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE")
                .parse()
                .context("Failed to parse PLAYBACK_PERIOD_SIZE")?,

            status_local_ip: env!("STATUS_LOCAL_IP").to_string(),
            status_local_port: env!("STATUS_LOCAL_PORT")
                .parse()
                .context("Failed to parse STATUS_LOCAL_PORT")?,
            status_remote_ip: env!("STATUS_REMOTE_IP").to_string(),
            status_remote_port: env!("STATUS_REMOTE_PORT")
                .parse()
                .context("Failed to parse STATUS_REMOTE_PORT")?,
            status_buffer_size: env!("STATUS_BUFFER_SIZE")
                .parse()
                .context("Failed to parse STATUS_BUFFER_SIZE")?,
        })
    }

    /// Override the endpoint from the first command line argument, if any.
    pub fn with_args(mut self, mut args: impl Iterator<Item = String>) -> Self {
        if let Some(url) = args.nth(1) {
            self.ws_url = url;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8765".to_string(),
            auto_connect: true,
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            sample_rate: 16000,
            channels: 1,
            block_size: 512,
            auto_gain_control: true,
            echo_cancellation: true,
            noise_suppression: true,
            play_time_reset_threshold_ms: 1.0,
            playback_period_size: 512,
            status_local_ip: "0.0.0.0".to_string(),
            status_local_port: 5680,
            status_remote_ip: "127.0.0.1".to_string(),
            status_remote_port: 5681,
            status_buffer_size: 1024,
        }
    }
}
