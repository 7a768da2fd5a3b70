use std::sync::{Arc, Mutex};

use tokio::signal;
use tokio::sync::mpsc;

use voicebot_linux_rs::audio::capture::{AlsaCapture, CaptureEvent};
use voicebot_linux_rs::audio::gate::{DuplexGate, PlaybackEvent};
use voicebot_linux_rs::audio::output::{AlsaOutput, SharedEcho};
use voicebot_linux_rs::audio::speex::EchoCanceller;
use voicebot_linux_rs::config::Config;
use voicebot_linux_rs::controller::CoreController;
use voicebot_linux_rs::net_link::NetEvent;
use voicebot_linux_rs::status_bridge::{Status, StatusBridge, StatusEvent, UiCommand};

// 回声消除尾长
const ECHO_TAIL_MS: u32 = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，第一个命令行参数可覆盖服务器地址
    let config = Config::new().unwrap_or_default().with_args(std::env::args());
    log::info!("Endpoint: {}", config.ws_url);

    // 事件通道
    let (tx_net_event, mut rx_net_event) = mpsc::channel::<NetEvent>(100);
    let (tx_capture_event, mut rx_capture_event) = mpsc::channel::<CaptureEvent>(100);
    let (tx_playback_event, mut rx_playback_event) = mpsc::unbounded_channel::<PlaybackEvent>();
    let (tx_ui_cmd, mut rx_ui_cmd) = mpsc::channel::<UiCommand>(16);
    let (tx_status, mut rx_status) = mpsc::unbounded_channel::<StatusEvent>();

    // 回声消除器由播放线程和录音线程共享
    let echo: Option<SharedEcho> = if config.echo_cancellation {
        match EchoCanceller::new(config.block_size, config.sample_rate, ECHO_TAIL_MS) {
            Ok(ec) => Some(Arc::new(Mutex::new(ec))),
            Err(e) => {
                log::warn!("Echo cancellation unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let output = Arc::new(AlsaOutput::start(&config, echo.clone())?);
    let gate = Arc::new(DuplexGate::new(Some(tx_playback_event)));

    // 启动状态桥，与UI进程通信
    let status_bridge = Arc::new(StatusBridge::new(&config, tx_ui_cmd).await?);
    let bridge_clone = status_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge_clone.run().await {
            log::error!("StatusBridge error: {}", e);
        }
    });
    let bridge_clone = status_bridge.clone();
    tokio::spawn(async move {
        while let Some(event) = rx_status.recv().await {
            if let Err(e) = bridge_clone.send_status(&event).await {
                log::warn!("Failed to send status to UI: {}", e);
            }
        }
    });

    let capture = AlsaCapture::new(&config, echo);
    let auto_connect = config.auto_connect;
    let mut controller = CoreController::new(
        config,
        output.clone(),
        gate,
        Box::new(capture),
        tx_net_event,
        tx_capture_event,
        tx_status,
    );

    controller.emit(Status::Ready);
    log::info!("{} {} started", env!("APP_NAME"), env!("APP_VERSION"));
    if auto_connect {
        let _ = controller.connect().await;
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            Some(event) = rx_net_event.recv() => controller.handle_net_event(event),
            Some(event) = rx_capture_event.recv() => controller.handle_capture_event(event),
            Some(event) = rx_playback_event.recv() => controller.handle_playback_event(event),
            Some(cmd) = rx_ui_cmd.recv() => controller.handle_ui_command(cmd).await,
        }
    }

    controller.close();
    drop(controller);
    output.stop();
    Ok(())
}
