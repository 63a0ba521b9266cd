//! Companion Session Runner
//!
//! Connects to the gateway and runs the session main loop. With the
//! `device` feature the default microphone feeds voice input; stdin always
//! accepts typed prompts.
//!
//! Console commands: `/voice` toggles push-to-talk, `/reconnect` forces a
//! reconnect, `/quit` shuts down. Anything else is sent as a text prompt.

use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use companion_core::{
    audio::create_shared_queue,
    client::SessionClient,
    clock::{MonotonicClock, SharedClock},
    config::AppConfig,
    constants::TICK_INTERVAL_MS,
    protocol::Message,
    session::{DeviceEvent, DeviceState, EventSender, SessionEffects},
    transport::TcpTransport,
};

/// Prints session output to the terminal
struct ConsoleEffects;

impl SessionEffects for ConsoleEffects {
    fn state_changed(&mut self, from: DeviceState, to: DeviceState) {
        tracing::debug!("{} -> {}", from, to);
        if to == DeviceState::Ready {
            println!("[ready]");
        }
    }

    fn show_response(&mut self, text: &str, is_final: bool) {
        if is_final {
            println!("{}", text);
        } else {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
    }

    fn report_error(&mut self, message: &str) {
        eprintln!("[error] {}", message);
    }

    fn listening(&mut self, active: bool) {
        println!("{}", if active { "[listening]" } else { "[sending]" });
    }

    fn gateway_notice(&mut self, message: &Message) {
        println!("[{}] {}", message.kind, message.payload_str().unwrap_or("<binary>"));
    }
}

fn spawn_console(events: EventSender<DeviceEvent>) -> Result<()> {
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "" => {}
                    "/voice" => events.post(DeviceEvent::VoiceKeyPressed),
                    "/reconnect" => events.post(DeviceEvent::ForceReconnect),
                    "/quit" => {
                        events.post(DeviceEvent::Shutdown);
                        break;
                    }
                    text => {
                        events.post(DeviceEvent::TextStarted);
                        events.post(DeviceEvent::TextSubmitted(text.to_string()));
                    }
                }
            }
        })
        .context("spawning console thread")?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting companion session");

    let mut config = AppConfig::load_or_default().context("loading configuration")?;
    if let Some(address) = std::env::args().nth(1) {
        config.gateway.address = address;
    }
    config.validate()?;

    tracing::info!(
        "Device {} ({}), gateway {}",
        config.device.name,
        config.device.id,
        config.gateway.address
    );

    let clock: SharedClock = Arc::new(MonotonicClock::new());
    let frames = create_shared_queue(config.audio.queue_capacity);
    let transport = TcpTransport::new(
        config.gateway.address.clone(),
        Duration::from_millis(config.gateway.connection_timeout_ms),
    );

    #[cfg(feature = "device")]
    let mut capture = {
        use companion_core::audio::{device::CpalSource, AudioCapture};

        let mut capture = AudioCapture::new(config.capture_config(), frames.clone(), clock.clone());
        match CpalSource::open(&config.audio.input_device, config.audio.sample_rate) {
            Ok(source) => capture.start(Box::new(source))?,
            Err(e) => tracing::warn!("Microphone unavailable, text only: {}", e),
        }
        capture
    };

    let client = SessionClient::new(
        config,
        transport,
        frames,
        clock,
        Box::new(ConsoleEffects),
    );
    #[cfg(feature = "device")]
    let client = client.with_capture_events(capture.events());
    let mut client = client;

    spawn_console(client.sender())?;
    client.begin();

    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                client.tick();
                if client.is_shutdown() {
                    break;
                }
            }
            _ = &mut interrupted => {
                tracing::info!("Interrupted, shutting down");
                client.post_event(DeviceEvent::Shutdown);
                client.tick();
                break;
            }
        }
    }

    #[cfg(feature = "device")]
    capture.stop();

    let stats = client.stats();
    tracing::info!(
        "Session ended: {} messages sent, {} received, {} audio frames",
        stats.messages_sent,
        stats.messages_received,
        stats.audio_frames_sent
    );

    Ok(())
}
