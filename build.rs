use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    audio: Audio,
    status: Status,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    auto_connect: bool,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u32,
    block_size: usize,
    auto_gain_control: bool,
    echo_cancellation: bool,
    noise_suppression: bool,
    play_time_reset_threshold_ms: f64,
    playback_period_size: usize,
}

#[derive(Deserialize)]
struct Status {
    local_ip: String,
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
    buffer_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量，同时链接 speexdsp
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=AUTO_CONNECT={}", config.network.auto_connect);

    // 音频配置
    let audio = &config.audio;
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", audio.playback_device);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", audio.channels);
    println!("cargo:rustc-env=AUDIO_BLOCK_SIZE={}", audio.block_size);
    println!("cargo:rustc-env=AUDIO_AGC={}", audio.auto_gain_control);
    println!("cargo:rustc-env=AUDIO_AEC={}", audio.echo_cancellation);
    println!("cargo:rustc-env=AUDIO_NS={}", audio.noise_suppression);
    println!(
        "cargo:rustc-env=PLAY_TIME_RESET_THRESHOLD_MS={}",
        audio.play_time_reset_threshold_ms
    );
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", audio.playback_period_size);

    // 状态桥配置
    println!("cargo:rustc-env=STATUS_LOCAL_IP={}", config.status.local_ip);
    println!("cargo:rustc-env=STATUS_LOCAL_PORT={}", config.status.local_port);
    println!("cargo:rustc-env=STATUS_REMOTE_IP={}", config.status.remote_ip);
    println!("cargo:rustc-env=STATUS_REMOTE_PORT={}", config.status.remote_port);
    println!("cargo:rustc-env=STATUS_BUFFER_SIZE={}", config.status.buffer_size);

    link_speexdsp();
}

fn link_speexdsp() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    // GNU 目标：ALSA 动态链接（由 alsa-sys 自动处理），speexdsp 通过 pkg-config 查找
    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
