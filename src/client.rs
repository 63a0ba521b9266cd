//! Main-loop context
//!
//! [`SessionClient::tick`] is the only place the session machine, the
//! reassembler and the transport are touched. Each tick:
//!
//! 1. capture notifications become lifecycle events
//! 2. queued voice frames are encoded and sent while listening
//! 3. transport bytes go through the reassembler; PING is answered, the
//!    rest becomes lifecycle events
//! 4. keepalive PING when due
//! 5. `update()` on the machine
//! 6. commands emitted by the machine's hooks are carried out

use bytes::Bytes;
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::audio::buffer::SharedFrameQueue;
use crate::audio::capture::CaptureEvent;
use crate::audio::vad::VadEvent;
use crate::clock::SharedClock;
use crate::codec::{select_encoder, AudioEncoder};
use crate::config::AppConfig;
use crate::protocol::payload::PingPayload;
use crate::protocol::{encode, AudioFormat, Message, MessageKind, StreamReassembler};
use crate::session::{
    build_device_machine, CommandOutbox, DeviceEvent, DeviceMachine, DeviceState, EventSender,
    SessionCommand, SessionEffects, SessionTimeouts,
};
use crate::transport::{ConnectStatus, Transport};

/// Client counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub audio_frames_sent: u64,
    pub audio_frames_discarded: u64,
    pub send_errors: u64,
    pub pings_answered: u64,
}

pub struct SessionClient<T: Transport> {
    config: AppConfig,
    format: AudioFormat,
    transport: T,
    reassembler: StreamReassembler,
    machine: DeviceMachine,
    outbox: CommandOutbox,
    events: EventSender<DeviceEvent>,
    frames: SharedFrameQueue,
    capture_events: Option<Receiver<CaptureEvent>>,
    encoder: Box<dyn AudioEncoder>,
    effects: Box<dyn SessionEffects>,
    clock: SharedClock,
    listening: bool,
    audio_errors: u32,
    /// AudioFailed already posted for the current error streak
    audio_failed_posted: bool,
    last_ping: u64,
    shutdown: bool,
    stats: ClientStats,
}

impl<T: Transport> SessionClient<T> {
    pub fn new(
        config: AppConfig,
        transport: T,
        frames: SharedFrameQueue,
        clock: SharedClock,
        effects: Box<dyn SessionEffects>,
    ) -> Self {
        let outbox = CommandOutbox::new();
        let machine = build_device_machine(SessionTimeouts::from_config(&config), &outbox);
        let events = machine.sender();
        let format = config.audio_format();
        let encoder = select_encoder(&format);

        Self {
            config,
            format,
            transport,
            reassembler: StreamReassembler::new(),
            machine,
            outbox,
            events,
            frames,
            capture_events: None,
            encoder,
            effects,
            clock,
            listening: false,
            audio_errors: 0,
            audio_failed_posted: false,
            last_ping: 0,
            shutdown: false,
            stats: ClientStats::default(),
        }
    }

    /// Receive voice and hardware notifications from a capture thread
    pub fn with_capture_events(mut self, events: Receiver<CaptureEvent>) -> Self {
        self.capture_events = Some(events);
        self
    }

    /// Start the lifecycle. Configuration is already loaded and the host
    /// network is up, so boot runs straight through to connecting.
    pub fn begin(&mut self) {
        let now = self.clock.now_ms();
        if let Err(e) = self.machine.start(now) {
            warn!("Cannot start session: {}", e);
            return;
        }
        self.events.post(DeviceEvent::BootComplete);
        self.events.post(DeviceEvent::ConfigLoaded);
        self.events.post(DeviceEvent::WifiConnected);
    }

    /// Run one main-loop iteration
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();

        self.drain_capture_events();
        self.drain_audio(now);
        self.drain_transport(now);
        self.keepalive(now);
        self.machine.update(now);
        self.run_commands(now);
    }

    /// Handle for posting events from input sources
    pub fn sender(&self) -> EventSender<DeviceEvent> {
        self.events.clone()
    }

    pub fn post_event(&self, event: DeviceEvent) {
        self.events.post(event);
    }

    pub fn state(&self) -> DeviceState {
        self.machine.current_state()
    }

    pub fn machine(&self) -> &DeviceMachine {
        &self.machine
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Consecutive capture read failures seen so far
    pub fn audio_error_streak(&self) -> u32 {
        self.audio_errors
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn drain_capture_events(&mut self) {
        let Some(rx) = self.capture_events.as_ref() else {
            return;
        };
        let pending: Vec<CaptureEvent> = rx.try_iter().collect();

        for event in pending {
            match event {
                CaptureEvent::Voice(VadEvent::VoiceDetected { at }) => {
                    self.events.post(DeviceEvent::VoiceDetected { at })
                }
                CaptureEvent::Voice(VadEvent::VoiceLost { at }) => {
                    self.events.post(DeviceEvent::VoiceLost { at })
                }
                CaptureEvent::ReadError {
                    message,
                    consecutive,
                } => {
                    self.audio_errors = consecutive;
                    // Events can be dropped when the channel is full, so the
                    // exact threshold value may never arrive
                    if consecutive >= self.config.audio.max_consecutive_errors
                        && !self.audio_failed_posted
                    {
                        self.audio_failed_posted = true;
                        warn!(consecutive, "Audio input failing: {}", message);
                        self.events.post(DeviceEvent::AudioFailed(format!(
                            "{} consecutive audio read errors: {}",
                            consecutive, message
                        )));
                    }
                }
                CaptureEvent::Recovered => {
                    self.audio_errors = 0;
                    self.audio_failed_posted = false;
                }
                CaptureEvent::Started | CaptureEvent::Stopped => {
                    debug!(?event, "Capture lifecycle");
                }
            }
        }
    }

    fn drain_audio(&mut self, now: u64) {
        if self.listening {
            self.send_pending_audio(now);
        } else if self.machine.current_state() != DeviceState::Ready {
            // Frames queued in READY are the start of an utterance that the
            // machine has not switched to VOICE_INPUT for yet
            self.discard_pending_audio();
        }
    }

    fn send_pending_audio(&mut self, now: u64) {
        for frame in self.frames.drain() {
            let data = match self.encoder.encode(&frame.samples) {
                Ok(data) => data,
                Err(e) => {
                    warn!(sequence = frame.sequence, "Dropping frame: {}", e);
                    self.stats.audio_frames_discarded += 1;
                    continue;
                }
            };
            let message = Message::audio(data, false, self.encoder.codec(), now as u32);
            if self.send(&message) {
                self.stats.audio_frames_sent += 1;
            }
        }
    }

    fn discard_pending_audio(&mut self) {
        let dropped = self.frames.drain().len();
        if dropped > 0 {
            debug!(dropped, "Discarding voice frames outside voice input");
            self.stats.audio_frames_discarded += dropped as u64;
        }
    }

    fn drain_transport(&mut self, now: u64) {
        self.poll_connect();
        if !self.transport.is_connected() {
            return;
        }

        let bytes = match self.transport.read() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.connection_lost(&e.to_string());
                return;
            }
        };
        if bytes.is_empty() {
            return;
        }

        for message in self.reassembler.feed(&bytes) {
            self.stats.messages_received += 1;
            self.handle_message(message, now);
        }
    }

    fn handle_message(&mut self, message: Message, now: u64) {
        debug!(kind = %message.kind, len = message.payload.len(), "Received message");

        match message.kind {
            MessageKind::Ping => {
                let ping_timestamp = message
                    .json::<PingPayload>()
                    .map(|p| p.timestamp)
                    .unwrap_or(message.timestamp);
                match Message::pong(ping_timestamp, now as u32) {
                    Ok(pong) => {
                        if self.send(&pong) {
                            self.stats.pings_answered += 1;
                        }
                    }
                    Err(e) => warn!("Cannot build PONG: {}", e),
                }
            }
            MessageKind::Pong => {
                debug!(rtt_ms = (now as u32).wrapping_sub(message.timestamp), "Gateway alive");
            }
            MessageKind::Status | MessageKind::Command => self.effects.gateway_notice(&message),
            _ => match DeviceEvent::from_message(&message) {
                Some(event) => self.events.post(event),
                None => debug!(kind = %message.kind, "Ignoring message"),
            },
        }
    }

    fn keepalive(&mut self, now: u64) {
        if !self.machine.current_state().is_online() {
            return;
        }
        if now.saturating_sub(self.last_ping) < self.config.gateway.ping_interval_ms {
            return;
        }
        self.last_ping = now;
        match Message::ping(now as u32) {
            Ok(ping) => {
                self.send(&ping);
            }
            Err(e) => warn!("Cannot build PING: {}", e),
        }
    }

    fn run_commands(&mut self, now: u64) {
        for command in self.outbox.drain() {
            match command {
                SessionCommand::ConnectGateway => self.connect(),
                SessionCommand::DisconnectGateway => {
                    self.transport.disconnect();
                    self.reassembler.reset();
                }
                SessionCommand::SendAuth => self.send_auth(now),
                SessionCommand::StartListening => self.start_listening(now),
                SessionCommand::StopListening => self.stop_listening(now),
                SessionCommand::SendText(text) => {
                    match Message::text(&text, &self.config.device.id, now as u32) {
                        Ok(message) => {
                            self.send(&message);
                        }
                        Err(e) => self.effects.report_error(&e.to_string()),
                    }
                }
                SessionCommand::ShowResponse { text, is_final } => {
                    self.effects.show_response(&text, is_final)
                }
                SessionCommand::ReportError(message) => self.effects.report_error(&message),
                SessionCommand::StateChanged { from, to } => {
                    if to.is_online() && !from.is_online() {
                        self.last_ping = now;
                    }
                    self.effects.state_changed(from, to);
                }
                SessionCommand::Shutdown => {
                    self.transport.disconnect();
                    self.shutdown = true;
                    info!("Session shut down");
                }
            }
        }
    }

    /// Start connecting. A pending connect is finished by a later tick; if
    /// it never finishes, the GATEWAY_CONNECTING timeout gives up on it.
    fn connect(&mut self) {
        self.reassembler.reset();
        match self.transport.connect() {
            Ok(ConnectStatus::Connected) => self.events.post(DeviceEvent::GatewayConnected),
            Ok(ConnectStatus::Pending) => debug!("Gateway connect pending"),
            Err(e) => self.connect_failed(&e.to_string()),
        }
    }

    fn poll_connect(&mut self) {
        match self.transport.poll_connect() {
            Some(Ok(())) => self.events.post(DeviceEvent::GatewayConnected),
            Some(Err(e)) => self.connect_failed(&e.to_string()),
            None => {}
        }
    }

    fn connect_failed(&mut self, reason: &str) {
        warn!(address = %self.config.gateway.address, "Gateway connection failed: {}", reason);
        self.events.post(DeviceEvent::GatewayFailed(reason.to_string()));
    }

    fn send_auth(&mut self, now: u64) {
        let device = &self.config.device;
        match Message::auth(
            &device.id,
            &device.name,
            &device.firmware_version,
            self.config.gateway.api_key.as_deref(),
            now as u32,
        ) {
            Ok(auth) => {
                self.send(&auth);
            }
            Err(e) => self.events.post(DeviceEvent::AuthFailed(e.to_string())),
        }
    }

    fn start_listening(&mut self, now: u64) {
        self.listening = true;
        self.effects.listening(true);

        match Message::audio_config(
            self.format.sample_rate,
            self.format.channels,
            self.format.bits_per_sample,
            self.encoder.codec(),
            now as u32,
        ) {
            Ok(announce) => {
                self.send(&announce);
            }
            Err(e) => warn!("Cannot build AUDIO_CONFIG: {}", e),
        }
        self.send_pending_audio(now);
    }

    fn stop_listening(&mut self, now: u64) {
        // Trailing hangover frames still belong to the utterance
        self.send_pending_audio(now);
        let marker = Message::audio(Bytes::new(), true, self.encoder.codec(), now as u32);
        self.send(&marker);
        self.listening = false;
        self.effects.listening(false);
    }

    /// Frame and write one message. A failed write means the connection is
    /// gone and is reported as a disconnect.
    fn send(&mut self, message: &Message) -> bool {
        let bytes = match encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = %message.kind, "Cannot encode message: {}", e);
                self.stats.send_errors += 1;
                return false;
            }
        };

        if !self.transport.is_connected() {
            self.stats.send_errors += 1;
            return false;
        }

        match self.transport.write(&bytes) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                true
            }
            Err(e) => {
                self.stats.send_errors += 1;
                self.connection_lost(&e.to_string());
                false
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        warn!("Gateway connection lost: {}", reason);
        self.transport.disconnect();
        self.reassembler.reset();
        self.events.post(DeviceEvent::GatewayDisconnected);
    }
}
