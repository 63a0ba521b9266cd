//! Device lifecycle: states, events and the transition table
//!
//! Hooks in the table never touch the transport or the UI directly. They
//! push [`SessionCommand`]s into a [`CommandOutbox`], which the session
//! client drains after every tick and carries out.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::machine::{MachineEvent, Rule, StateConfig, StateMachine};
use crate::config::AppConfig;
use crate::protocol::payload::{AuthResponsePayload, ErrorPayload, ResponsePayload};
use crate::protocol::{Message, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Boot,
    ConfigLoading,
    ConfigError,
    WifiConnecting,
    WifiError,
    GatewayConnecting,
    GatewayError,
    Authenticating,
    Ready,
    VoiceInput,
    TextInput,
    AiProcessing,
    AiResponding,
    Error,
    ShuttingDown,
}

impl DeviceState {
    pub const ALL: [DeviceState; 15] = [
        DeviceState::Boot,
        DeviceState::ConfigLoading,
        DeviceState::ConfigError,
        DeviceState::WifiConnecting,
        DeviceState::WifiError,
        DeviceState::GatewayConnecting,
        DeviceState::GatewayError,
        DeviceState::Authenticating,
        DeviceState::Ready,
        DeviceState::VoiceInput,
        DeviceState::TextInput,
        DeviceState::AiProcessing,
        DeviceState::AiResponding,
        DeviceState::Error,
        DeviceState::ShuttingDown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Boot => "BOOT",
            DeviceState::ConfigLoading => "CONFIG_LOADING",
            DeviceState::ConfigError => "CONFIG_ERROR",
            DeviceState::WifiConnecting => "WIFI_CONNECTING",
            DeviceState::WifiError => "WIFI_ERROR",
            DeviceState::GatewayConnecting => "GATEWAY_CONNECTING",
            DeviceState::GatewayError => "GATEWAY_ERROR",
            DeviceState::Authenticating => "AUTHENTICATING",
            DeviceState::Ready => "READY",
            DeviceState::VoiceInput => "VOICE_INPUT",
            DeviceState::TextInput => "TEXT_INPUT",
            DeviceState::AiProcessing => "AI_PROCESSING",
            DeviceState::AiResponding => "AI_RESPONDING",
            DeviceState::Error => "ERROR",
            DeviceState::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// States in which the gateway session is authenticated
    pub fn is_online(self) -> bool {
        matches!(
            self,
            DeviceState::Ready
                | DeviceState::VoiceInput
                | DeviceState::TextInput
                | DeviceState::AiProcessing
                | DeviceState::AiResponding
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can drive the device lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    BootComplete,
    ConfigLoaded,
    ConfigFailed(String),
    WifiConnected,
    WifiDisconnected,
    WifiFailed(String),
    GatewayConnected,
    GatewayDisconnected,
    GatewayFailed(String),
    Authenticated,
    AuthFailed(String),
    /// The user started typing
    TextStarted,
    TextSubmitted(String),
    /// Push-to-talk key; toggles voice input
    VoiceKeyPressed,
    VoiceDetected { at: u64 },
    VoiceLost { at: u64 },
    AiResponseChunk(String),
    AiResponseComplete(String),
    AiError { message: String, code: Option<i32> },
    AudioFailed(String),
    ErrorRecovered,
    ForceReconnect,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    BootComplete,
    ConfigLoaded,
    ConfigFailed,
    WifiConnected,
    WifiDisconnected,
    WifiFailed,
    GatewayConnected,
    GatewayDisconnected,
    GatewayFailed,
    Authenticated,
    AuthFailed,
    TextStarted,
    TextSubmitted,
    VoiceKeyPressed,
    VoiceDetected,
    VoiceLost,
    AiResponseChunk,
    AiResponseComplete,
    AiError,
    AudioFailed,
    ErrorRecovered,
    ForceReconnect,
    Shutdown,
}

impl MachineEvent for DeviceEvent {
    type Kind = DeviceEventKind;

    fn kind(&self) -> DeviceEventKind {
        match self {
            DeviceEvent::BootComplete => DeviceEventKind::BootComplete,
            DeviceEvent::ConfigLoaded => DeviceEventKind::ConfigLoaded,
            DeviceEvent::ConfigFailed(_) => DeviceEventKind::ConfigFailed,
            DeviceEvent::WifiConnected => DeviceEventKind::WifiConnected,
            DeviceEvent::WifiDisconnected => DeviceEventKind::WifiDisconnected,
            DeviceEvent::WifiFailed(_) => DeviceEventKind::WifiFailed,
            DeviceEvent::GatewayConnected => DeviceEventKind::GatewayConnected,
            DeviceEvent::GatewayDisconnected => DeviceEventKind::GatewayDisconnected,
            DeviceEvent::GatewayFailed(_) => DeviceEventKind::GatewayFailed,
            DeviceEvent::Authenticated => DeviceEventKind::Authenticated,
            DeviceEvent::AuthFailed(_) => DeviceEventKind::AuthFailed,
            DeviceEvent::TextStarted => DeviceEventKind::TextStarted,
            DeviceEvent::TextSubmitted(_) => DeviceEventKind::TextSubmitted,
            DeviceEvent::VoiceKeyPressed => DeviceEventKind::VoiceKeyPressed,
            DeviceEvent::VoiceDetected { .. } => DeviceEventKind::VoiceDetected,
            DeviceEvent::VoiceLost { .. } => DeviceEventKind::VoiceLost,
            DeviceEvent::AiResponseChunk(_) => DeviceEventKind::AiResponseChunk,
            DeviceEvent::AiResponseComplete(_) => DeviceEventKind::AiResponseComplete,
            DeviceEvent::AiError { .. } => DeviceEventKind::AiError,
            DeviceEvent::AudioFailed(_) => DeviceEventKind::AudioFailed,
            DeviceEvent::ErrorRecovered => DeviceEventKind::ErrorRecovered,
            DeviceEvent::ForceReconnect => DeviceEventKind::ForceReconnect,
            DeviceEvent::Shutdown => DeviceEventKind::Shutdown,
        }
    }
}

impl DeviceEvent {
    /// Lifecycle event carried by an incoming gateway message, if any.
    /// PING, STATUS and COMMAND are handled by the client directly.
    pub fn from_message(message: &Message) -> Option<Self> {
        match message.kind {
            MessageKind::AuthResponse => Some(match message.json::<AuthResponsePayload>() {
                Ok(body) if body.success => DeviceEvent::Authenticated,
                Ok(body) => DeviceEvent::AuthFailed(
                    body.error
                        .unwrap_or_else(|| "authentication rejected".to_string()),
                ),
                Err(e) => DeviceEvent::AuthFailed(e.to_string()),
            }),
            MessageKind::Response => Some(DeviceEvent::AiResponseChunk(response_text(message))),
            MessageKind::ResponseFinal => {
                Some(DeviceEvent::AiResponseComplete(response_text(message)))
            }
            MessageKind::Error => Some(match message.json::<ErrorPayload>() {
                Ok(body) => DeviceEvent::AiError {
                    message: body.error,
                    code: body.code,
                },
                Err(_) => DeviceEvent::AiError {
                    message: message.payload_str().unwrap_or_default().to_string(),
                    code: None,
                },
            }),
            _ => None,
        }
    }
}

/// Response text from a JSON body, or the raw payload when it is plain text
fn response_text(message: &Message) -> String {
    match message.json::<ResponsePayload>() {
        Ok(body) => body.text,
        Err(_) => message.payload_str().unwrap_or_default().to_string(),
    }
}

/// Side effects requested by the lifecycle table
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    ConnectGateway,
    DisconnectGateway,
    SendAuth,
    StartListening,
    /// Stop forwarding audio and send the end-of-utterance marker
    StopListening,
    SendText(String),
    ShowResponse { text: String, is_final: bool },
    ReportError(String),
    StateChanged { from: DeviceState, to: DeviceState },
    Shutdown,
}

/// Queue of commands produced by table hooks
#[derive(Debug, Clone, Default)]
pub struct CommandOutbox {
    commands: Arc<Mutex<Vec<SessionCommand>>>,
}

impl CommandOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: SessionCommand) {
        self.commands.lock().push(command);
    }

    /// Take every queued command, oldest first
    pub fn drain(&self) -> Vec<SessionCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }
}

/// Presentation side of the session. Every method defaults to a no-op.
pub trait SessionEffects: Send {
    fn state_changed(&mut self, _from: DeviceState, _to: DeviceState) {}

    fn show_response(&mut self, _text: &str, _is_final: bool) {}

    fn report_error(&mut self, _message: &str) {}

    fn listening(&mut self, _active: bool) {}

    /// Gateway STATUS or COMMAND message, passed through untouched
    fn gateway_notice(&mut self, _message: &Message) {}
}

/// Effects sink that ignores everything
#[derive(Debug, Default)]
pub struct NoEffects;

impl SessionEffects for NoEffects {}

/// Timing of the lifecycle table, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub boot_ms: u64,
    pub wifi_connect_ms: u64,
    pub gateway_connect_ms: u64,
    pub auth_ms: u64,
    pub max_voice_ms: u64,
    pub retry_ms: u64,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            boot_ms: 2_000,
            wifi_connect_ms: 30_000,
            gateway_connect_ms: 10_000,
            auth_ms: 10_000,
            max_voice_ms: 30_000,
            retry_ms: 5_000,
        }
    }
}

impl SessionTimeouts {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            gateway_connect_ms: config.gateway.connection_timeout_ms,
            auth_ms: config.gateway.auth_timeout_ms,
            max_voice_ms: config.audio.max_voice_ms,
            retry_ms: config.gateway.reconnect_interval_ms,
            ..Self::default()
        }
    }
}

pub type DeviceMachine = StateMachine<DeviceState, DeviceEvent>;

type DeviceStateConfig = StateConfig<DeviceState, DeviceEvent>;

fn emit(outbox: &CommandOutbox, command: SessionCommand) -> impl FnMut() + Send + 'static {
    let outbox = outbox.clone();
    move || outbox.push(command.clone())
}

/// Rules shared by every connected state
fn connection_rules(state: DeviceStateConfig) -> DeviceStateConfig {
    state
        .on(DeviceEventKind::WifiDisconnected, DeviceState::WifiConnecting)
        .on(DeviceEventKind::GatewayDisconnected, DeviceState::GatewayConnecting)
        .on(DeviceEventKind::ForceReconnect, DeviceState::GatewayConnecting)
        .on(DeviceEventKind::Shutdown, DeviceState::ShuttingDown)
}

fn show_chunk(outbox: &CommandOutbox) -> impl FnMut(&DeviceEvent) + Send + 'static {
    let outbox = outbox.clone();
    move |event| match event {
        DeviceEvent::AiResponseChunk(text) => outbox.push(SessionCommand::ShowResponse {
            text: text.clone(),
            is_final: false,
        }),
        DeviceEvent::AiResponseComplete(text) => outbox.push(SessionCommand::ShowResponse {
            text: text.clone(),
            is_final: true,
        }),
        _ => {}
    }
}

fn report(outbox: &CommandOutbox) -> impl FnMut(&DeviceEvent) + Send + 'static {
    let outbox = outbox.clone();
    move |event| {
        let message = match event {
            DeviceEvent::ConfigFailed(m)
            | DeviceEvent::WifiFailed(m)
            | DeviceEvent::GatewayFailed(m)
            | DeviceEvent::AuthFailed(m)
            | DeviceEvent::AudioFailed(m) => m.clone(),
            DeviceEvent::AiError { message, code: Some(code) } => format!("{} ({})", message, code),
            DeviceEvent::AiError { message, code: None } => message.clone(),
            other => format!("{:?}", other.kind()),
        };
        outbox.push(SessionCommand::ReportError(message));
    }
}

fn send_text(outbox: &CommandOutbox) -> impl FnMut(&DeviceEvent) + Send + 'static {
    let outbox = outbox.clone();
    move |event| {
        if let DeviceEvent::TextSubmitted(text) = event {
            outbox.push(SessionCommand::SendText(text.clone()));
        }
    }
}

fn non_empty_text(event: &DeviceEvent) -> bool {
    matches!(event, DeviceEvent::TextSubmitted(text) if !text.trim().is_empty())
}

/// Build the device lifecycle machine, starting in BOOT
pub fn build_device_machine(timeouts: SessionTimeouts, outbox: &CommandOutbox) -> DeviceMachine {
    use DeviceEventKind as K;
    use DeviceState as S;

    let mut sm = StateMachine::new(S::Boot);

    sm.add_state(
        StateConfig::new(S::Boot)
            .timeout(timeouts.boot_ms, S::ConfigLoading)
            .on(K::BootComplete, S::ConfigLoading)
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::ConfigLoading)
            .on(K::ConfigLoaded, S::WifiConnecting)
            .rule(Rule::on(K::ConfigFailed, S::ConfigError).then(report(outbox)))
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::ConfigError)
            .timeout(timeouts.retry_ms, S::ConfigLoading)
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::WifiConnecting)
            .timeout(timeouts.wifi_connect_ms, S::WifiError)
            .on(K::WifiConnected, S::GatewayConnecting)
            .rule(Rule::on(K::WifiFailed, S::WifiError).then(report(outbox)))
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::WifiError)
            .timeout(timeouts.retry_ms, S::WifiConnecting)
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::GatewayConnecting)
            .on_entry(emit(outbox, SessionCommand::ConnectGateway))
            .timeout(timeouts.gateway_connect_ms, S::GatewayError)
            .on(K::GatewayConnected, S::Authenticating)
            .rule(Rule::on(K::GatewayFailed, S::GatewayError).then(report(outbox)))
            .on(K::WifiDisconnected, S::WifiConnecting)
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::GatewayError)
            .on_entry(emit(outbox, SessionCommand::DisconnectGateway))
            .timeout(timeouts.retry_ms, S::GatewayConnecting)
            .on(K::WifiDisconnected, S::WifiConnecting)
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::Authenticating)
            .on_entry(emit(outbox, SessionCommand::SendAuth))
            .timeout(timeouts.auth_ms, S::Error)
            .on(K::Authenticated, S::Ready)
            .rule(Rule::on(K::AuthFailed, S::Error).then(report(outbox)))
            .on(K::GatewayDisconnected, S::GatewayConnecting)
            .on(K::WifiDisconnected, S::WifiConnecting)
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(connection_rules(
        StateConfig::new(S::Ready)
            .on(K::VoiceKeyPressed, S::VoiceInput)
            .on(K::VoiceDetected, S::VoiceInput)
            .on(K::TextStarted, S::TextInput)
            .rule(
                Rule::on(K::TextSubmitted, S::AiProcessing)
                    .when(non_empty_text)
                    .then(send_text(outbox)),
            )
            .rule(Rule::on(K::AudioFailed, S::Error).then(report(outbox))),
    ));
    sm.add_state(connection_rules(
        StateConfig::new(S::VoiceInput)
            .on_entry(emit(outbox, SessionCommand::StartListening))
            .on_exit(emit(outbox, SessionCommand::StopListening))
            .timeout(timeouts.max_voice_ms, S::AiProcessing)
            .on(K::VoiceLost, S::AiProcessing)
            .on(K::VoiceKeyPressed, S::AiProcessing)
            .rule(Rule::on(K::AudioFailed, S::Error).then(report(outbox))),
    ));
    sm.add_state(connection_rules(
        StateConfig::new(S::TextInput)
            .rule(
                Rule::on(K::TextSubmitted, S::AiProcessing)
                    .when(non_empty_text)
                    .then(send_text(outbox)),
            )
            .on(K::TextSubmitted, S::Ready)
            .on(K::VoiceKeyPressed, S::VoiceInput),
    ));
    sm.add_state(connection_rules(
        StateConfig::new(S::AiProcessing)
            .rule(Rule::on(K::AiResponseChunk, S::AiResponding).then(show_chunk(outbox)))
            .rule(Rule::on(K::AiResponseComplete, S::Ready).then(show_chunk(outbox)))
            .rule(Rule::on(K::AiError, S::Ready).then(report(outbox))),
    ));
    sm.add_state(connection_rules(
        StateConfig::new(S::AiResponding)
            .rule(Rule::on(K::AiResponseChunk, S::AiResponding).then(show_chunk(outbox)))
            .rule(Rule::on(K::AiResponseComplete, S::Ready).then(show_chunk(outbox)))
            .rule(Rule::on(K::AiError, S::Ready).then(report(outbox))),
    ));
    sm.add_state(
        StateConfig::new(S::Error)
            .on_entry(emit(outbox, SessionCommand::DisconnectGateway))
            .timeout(timeouts.retry_ms, S::GatewayConnecting)
            .on(K::ErrorRecovered, S::GatewayConnecting)
            .on(K::ForceReconnect, S::GatewayConnecting)
            .on(K::WifiDisconnected, S::WifiConnecting)
            .on(K::Shutdown, S::ShuttingDown),
    );
    sm.add_state(
        StateConfig::new(S::ShuttingDown).on_entry(emit(outbox, SessionCommand::Shutdown)),
    );

    let changes = outbox.clone();
    sm.on_state_change(move |from, to| changes.push(SessionCommand::StateChanged { from, to }));

    sm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AudioCodec;

    fn machine() -> (DeviceMachine, CommandOutbox) {
        let outbox = CommandOutbox::new();
        let mut sm = build_device_machine(SessionTimeouts::default(), &outbox);
        sm.start(0).unwrap();
        (sm, outbox)
    }

    fn commands(outbox: &CommandOutbox) -> Vec<SessionCommand> {
        outbox
            .drain()
            .into_iter()
            .filter(|c| !matches!(c, SessionCommand::StateChanged { .. }))
            .collect()
    }

    /// Drive the machine from BOOT to READY
    fn online(sm: &mut DeviceMachine, outbox: &CommandOutbox) {
        for event in [
            DeviceEvent::BootComplete,
            DeviceEvent::ConfigLoaded,
            DeviceEvent::WifiConnected,
            DeviceEvent::GatewayConnected,
            DeviceEvent::Authenticated,
        ] {
            sm.post_event(event);
            sm.update(10);
        }
        assert_eq!(sm.current_state(), DeviceState::Ready);
        outbox.drain();
    }

    #[test]
    fn test_every_state_registered() {
        let (sm, _) = machine();
        assert!(DeviceState::ALL.iter().all(|s| sm.has_state(*s)));
    }

    #[test]
    fn test_boot_times_out_into_config_loading() {
        let (mut sm, _) = machine();
        sm.update(1999);
        assert_eq!(sm.current_state(), DeviceState::Boot);
        sm.update(2000);
        assert_eq!(sm.current_state(), DeviceState::ConfigLoading);
    }

    #[test]
    fn test_connect_and_authenticate() {
        let (mut sm, outbox) = machine();
        sm.post_event(DeviceEvent::BootComplete);
        sm.post_event(DeviceEvent::ConfigLoaded);
        sm.post_event(DeviceEvent::WifiConnected);
        sm.update(10);
        assert_eq!(sm.current_state(), DeviceState::GatewayConnecting);
        assert_eq!(commands(&outbox), vec![SessionCommand::ConnectGateway]);

        sm.post_event(DeviceEvent::GatewayConnected);
        sm.update(20);
        assert_eq!(commands(&outbox), vec![SessionCommand::SendAuth]);

        sm.post_event(DeviceEvent::Authenticated);
        sm.update(30);
        assert_eq!(sm.current_state(), DeviceState::Ready);
        assert!(sm.current_state().is_online());
    }

    #[test]
    fn test_auth_timeout_enters_error_then_retries() {
        let (mut sm, outbox) = machine();
        for event in [
            DeviceEvent::BootComplete,
            DeviceEvent::ConfigLoaded,
            DeviceEvent::WifiConnected,
            DeviceEvent::GatewayConnected,
        ] {
            sm.post_event(event);
        }
        sm.update(100);
        assert_eq!(sm.current_state(), DeviceState::Authenticating);

        sm.update(10_099);
        assert_eq!(sm.current_state(), DeviceState::Authenticating);
        sm.update(10_100);
        assert_eq!(sm.current_state(), DeviceState::Error);

        outbox.drain();
        sm.update(15_100);
        assert_eq!(sm.current_state(), DeviceState::GatewayConnecting);
        assert_eq!(commands(&outbox), vec![SessionCommand::ConnectGateway]);
    }

    #[test]
    fn test_voice_round_trip() {
        let (mut sm, outbox) = machine();
        online(&mut sm, &outbox);

        sm.post_event(DeviceEvent::VoiceDetected { at: 200 });
        sm.update(200);
        assert_eq!(sm.current_state(), DeviceState::VoiceInput);
        assert_eq!(commands(&outbox), vec![SessionCommand::StartListening]);

        sm.post_event(DeviceEvent::VoiceLost { at: 800 });
        sm.update(800);
        assert_eq!(sm.current_state(), DeviceState::AiProcessing);
        assert_eq!(commands(&outbox), vec![SessionCommand::StopListening]);

        sm.post_event(DeviceEvent::AiResponseChunk("Hel".into()));
        sm.post_event(DeviceEvent::AiResponseChunk("lo".into()));
        sm.post_event(DeviceEvent::AiResponseComplete("!".into()));
        sm.update(900);
        assert_eq!(sm.current_state(), DeviceState::Ready);
        assert_eq!(
            commands(&outbox),
            vec![
                SessionCommand::ShowResponse { text: "Hel".into(), is_final: false },
                SessionCommand::ShowResponse { text: "lo".into(), is_final: false },
                SessionCommand::ShowResponse { text: "!".into(), is_final: true },
            ]
        );
    }

    #[test]
    fn test_voice_capped_by_max_duration() {
        let (mut sm, outbox) = machine();
        online(&mut sm, &outbox);
        sm.post_event(DeviceEvent::VoiceKeyPressed);
        sm.update(1_000);
        sm.update(31_000);
        assert_eq!(sm.current_state(), DeviceState::AiProcessing);
    }

    #[test]
    fn test_blank_text_not_sent() {
        let (mut sm, outbox) = machine();
        online(&mut sm, &outbox);

        sm.post_event(DeviceEvent::TextSubmitted("   ".into()));
        sm.update(50);
        assert_eq!(sm.current_state(), DeviceState::Ready);
        assert!(commands(&outbox).is_empty());

        sm.post_event(DeviceEvent::TextSubmitted("weather?".into()));
        sm.update(60);
        assert_eq!(sm.current_state(), DeviceState::AiProcessing);
        assert_eq!(commands(&outbox), vec![SessionCommand::SendText("weather?".into())]);
    }

    #[test]
    fn test_audio_failure_reported() {
        let (mut sm, outbox) = machine();
        online(&mut sm, &outbox);
        sm.post_event(DeviceEvent::VoiceKeyPressed);
        sm.update(20);
        outbox.drain();

        sm.post_event(DeviceEvent::AudioFailed("5 consecutive read errors".into()));
        sm.update(30);
        assert_eq!(sm.current_state(), DeviceState::Error);
        assert_eq!(
            commands(&outbox),
            vec![
                SessionCommand::ReportError("5 consecutive read errors".into()),
                SessionCommand::StopListening,
                SessionCommand::DisconnectGateway,
            ]
        );
    }

    #[test]
    fn test_gateway_loss_reconnects() {
        let (mut sm, outbox) = machine();
        online(&mut sm, &outbox);
        sm.post_event(DeviceEvent::GatewayDisconnected);
        sm.update(40);
        assert_eq!(sm.current_state(), DeviceState::GatewayConnecting);
        assert_eq!(commands(&outbox), vec![SessionCommand::ConnectGateway]);
    }

    #[test]
    fn test_state_changes_published() {
        let (mut sm, outbox) = machine();
        sm.post_event(DeviceEvent::Shutdown);
        sm.update(5);
        assert_eq!(
            outbox.drain(),
            vec![
                SessionCommand::Shutdown,
                SessionCommand::StateChanged {
                    from: DeviceState::Boot,
                    to: DeviceState::ShuttingDown,
                },
            ]
        );
    }

    #[test]
    fn test_events_from_messages() {
        let ok = Message::auth_response(true, None, 0).unwrap();
        assert_eq!(DeviceEvent::from_message(&ok), Some(DeviceEvent::Authenticated));

        let denied = Message::auth_response(false, Some("bad key"), 0).unwrap();
        assert_eq!(
            DeviceEvent::from_message(&denied),
            Some(DeviceEvent::AuthFailed("bad key".into()))
        );

        let chunk = Message::response("hi", false, 0).unwrap();
        assert_eq!(
            DeviceEvent::from_message(&chunk),
            Some(DeviceEvent::AiResponseChunk("hi".into()))
        );

        let done = Message::response("bye", true, 0).unwrap();
        assert_eq!(
            DeviceEvent::from_message(&done),
            Some(DeviceEvent::AiResponseComplete("bye".into()))
        );

        let err = Message::error("overloaded", Some(503), 0).unwrap();
        assert_eq!(
            DeviceEvent::from_message(&err),
            Some(DeviceEvent::AiError { message: "overloaded".into(), code: Some(503) })
        );

        let plain = Message::new(MessageKind::Response, &b"raw text"[..], 0);
        assert_eq!(
            DeviceEvent::from_message(&plain),
            Some(DeviceEvent::AiResponseChunk("raw text".into()))
        );

        let status = Message::status("busy", 0).unwrap();
        assert_eq!(DeviceEvent::from_message(&status), None);
        let audio = Message::audio(vec![0u8; 2], false, AudioCodec::Pcm, 0);
        assert_eq!(DeviceEvent::from_message(&audio), None);
    }
}
