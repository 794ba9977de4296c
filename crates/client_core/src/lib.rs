use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use shared::{
    domain::{
        AudioDevice, ConnectorState, Cookie, DeviceId, DevicePolicy, Handle, TransmissionPolicy,
        UdpPortRange, Uri,
    },
    error::ClientError,
    protocol::{RequestBody, TransportMessage, VoiceEvent, VoiceRequest, VoiceResponse},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use transport::VoiceTransport;

pub mod channel;
pub mod convergent;
pub mod events;
pub mod login;
pub mod participant;
pub mod session_group;

pub use events::{AudioDirection, ClientEvent};
use events::EventSink;
use login::LoginManager;

pub const MAX_VOLUME: u32 = 100;
pub const DEFAULT_MASTER_VOLUME: u32 = 50;

/// Monotonic source for request cookies and client-side handles, owned by
/// the connection so separate connections never interfere.
#[derive(Debug, Default)]
pub struct HandleSource {
    next: u64,
}

impl HandleSource {
    fn bump(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    pub fn next_cookie(&mut self) -> Cookie {
        Cookie::new(format!("req-{}", self.bump()))
    }

    pub fn next_handle(&mut self, kind: &str) -> Handle {
        Handle::new(format!("{kind}-{}", self.bump()))
    }
}

/// Embedder-supplied hook for invariant violations; production embedders
/// typically log and continue.
pub trait InvariantHook: Send + Sync {
    fn invariant_failed(&self, message: &str);
}

pub struct TracingInvariantHook;

impl InvariantHook for TracingInvariantHook {
    fn invariant_failed(&self, message: &str) {
        error!(detail = message, "invariant violated");
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// When false, logging in one account logs every other account out.
    pub multi_login: bool,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            multi_login: false,
            event_capacity: 1024,
        }
    }
}

/// Borrowed context threaded through one reconciliation pass.
pub struct ReconcileCtx<'a> {
    pub transport: &'a dyn VoiceTransport,
    pub ids: &'a mut HandleSource,
    pub events: &'a EventSink,
}

impl ReconcileCtx<'_> {
    pub fn issue(&mut self, body: RequestBody) -> Result<(), ClientError> {
        let request = VoiceRequest {
            cookie: self.ids.next_cookie(),
            body,
        };
        debug!(cookie = %request.cookie, "issuing request");
        self.transport
            .issue_request(request)
            .map_err(|err| ClientError::Transport(err.to_string()))
    }
}

#[derive(Debug)]
struct Connector {
    desired_server: Option<Uri>,
    current_server: Option<Uri>,
    desired_ports: UdpPortRange,
    current_ports: UdpPortRange,
    desired_state: ConnectorState,
    current_state: ConnectorState,
    handle: Handle,
}

impl Connector {
    fn new() -> Self {
        Self {
            desired_server: None,
            current_server: None,
            desired_ports: UdpPortRange::default(),
            current_ports: UdpPortRange::default(),
            desired_state: ConnectorState::Uninitialized,
            current_state: ConnectorState::Uninitialized,
            handle: Handle::new(""),
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Single source of truth for the connector lifecycle, the login map, audio
/// device selection, and master volume policy. Public calls mutate desired
/// state and run one reconciliation pass; inbound responses and events are
/// dispatched down the ownership chain by handle lookup and are the only
/// writers of current state.
pub struct ClientConnection {
    transport: Arc<dyn VoiceTransport>,
    config: ClientConfig,
    hook: Arc<dyn InvariantHook>,
    ids: HandleSource,
    events: EventSink,
    connector: Connector,
    logins: BTreeMap<String, LoginManager>,
    input_device: convergent::Convergent<DevicePolicy>,
    output_device: convergent::Convergent<DevicePolicy>,
    master_input_volume: convergent::Convergent<u32>,
    master_output_volume: convergent::Convergent<u32>,
    capture_devices: Vec<AudioDevice>,
    render_devices: Vec<AudioDevice>,
}

impl ClientConnection {
    pub fn new(transport: Arc<dyn VoiceTransport>, config: ClientConfig) -> Self {
        Self::with_hook(transport, config, Arc::new(TracingInvariantHook))
    }

    pub fn with_hook(
        transport: Arc<dyn VoiceTransport>,
        config: ClientConfig,
        hook: Arc<dyn InvariantHook>,
    ) -> Self {
        let events = EventSink::new(config.event_capacity);
        Self {
            transport,
            config,
            hook,
            ids: HandleSource::default(),
            events,
            connector: Connector::new(),
            logins: BTreeMap::new(),
            input_device: convergent::Convergent::new(DevicePolicy::DefaultSystem),
            output_device: convergent::Convergent::new(DevicePolicy::DefaultSystem),
            master_input_volume: convergent::Convergent::new(DEFAULT_MASTER_VOLUME),
            master_output_volume: convergent::Convergent::new(DEFAULT_MASTER_VOLUME),
            capture_devices: Vec::new(),
            render_devices: Vec::new(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    pub fn connector_state(&self) -> ConnectorState {
        self.connector.current_state
    }

    pub fn udp_port_range(&self) -> UdpPortRange {
        self.connector.current_ports
    }

    pub fn account(&self, account_name: &str) -> Option<&LoginManager> {
        self.logins.get(account_name)
    }

    pub fn capture_devices(&self) -> &[AudioDevice] {
        &self.capture_devices
    }

    pub fn render_devices(&self) -> &[AudioDevice] {
        &self.render_devices
    }

    // ---- public operations -------------------------------------------------

    pub fn connect(
        &mut self,
        server_uri: &str,
        udp_port_range: UdpPortRange,
    ) -> Result<(), ClientError> {
        url::Url::parse(server_uri)
            .map_err(|err| ClientError::invalid_argument(format!("server uri: {err}")))?;
        let server = Uri::new(server_uri);
        if self.connector.desired_state == ConnectorState::Initialized
            && self.connector.desired_server.as_ref() == Some(&server)
        {
            return Ok(());
        }
        self.connector.desired_server = Some(server);
        self.connector.desired_ports = udp_port_range;
        self.connector.desired_state = ConnectorState::Initialized;
        self.next_state()
    }

    /// Naming a server that is not the currently desired one is a contract
    /// violation; it is routed through the invariant hook and does nothing.
    pub fn disconnect(&mut self, server_uri: &str) -> Result<(), ClientError> {
        let server = Uri::new(server_uri);
        if self.connector.desired_server.as_ref() != Some(&server) {
            self.hook.invariant_failed(&format!(
                "disconnect called for {server} but desired server is {:?}",
                self.connector.desired_server
            ));
            return Ok(());
        }
        self.logins.clear();
        self.connector.desired_state = ConnectorState::Uninitialized;
        if self.connector.current_state == ConnectorState::Uninitialized {
            // Nothing to tear down; confirm right away.
            self.events.emit(ClientEvent::DisconnectCompleted);
            return Ok(());
        }
        self.next_state()
    }

    pub fn login(&mut self, account_name: &str, credentials: &str) -> Result<(), ClientError> {
        if account_name.is_empty() {
            return Err(ClientError::invalid_argument("empty account name"));
        }
        if self.connector.desired_server.is_none() {
            return Err(ClientError::not_connected("no server desired"));
        }
        if !self.config.multi_login {
            for (name, other) in self.logins.iter_mut() {
                if name != account_name {
                    other.set_desired_logged_out();
                }
            }
        }
        let login = match self.logins.entry(account_name.to_string()) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                let handle = self.ids.next_handle("acct");
                let group_handle = self.ids.next_handle("sg");
                entry.insert(LoginManager::new(
                    account_name.to_string(),
                    handle,
                    group_handle,
                ))
            }
        };
        login.set_desired_logged_in(credentials.to_string());
        self.next_state()
    }

    pub fn logout(&mut self, account_name: &str) -> Result<(), ClientError> {
        self.login_mut(account_name)?.set_desired_logged_out();
        self.next_state()
    }

    pub fn join_channel(
        &mut self,
        account_name: &str,
        channel_uri: &str,
        access_token: Option<String>,
        multi_channel: bool,
    ) -> Result<(), ClientError> {
        let uri = valid_uri(channel_uri)?;
        self.login_mut(account_name)?
            .session_group_mut()
            .join_channel(uri, access_token, multi_channel);
        self.next_state()
    }

    pub fn leave_channel(&mut self, account_name: &str, channel_uri: &str) -> Result<(), ClientError> {
        let uri = valid_uri(channel_uri)?;
        self.login_mut(account_name)?
            .session_group_mut()
            .leave_channel(&uri)?;
        self.next_state()
    }

    pub fn leave_all(&mut self, account_name: &str) -> Result<(), ClientError> {
        self.login_mut(account_name)?.session_group_mut().leave_all();
        self.next_state()
    }

    pub fn block_users(&mut self, account_name: &str, uris: &[Uri]) -> Result<(), ClientError> {
        self.login_mut(account_name)?.block_users(uris);
        self.next_state()
    }

    pub fn unblock_users(&mut self, account_name: &str, uris: &[Uri]) -> Result<(), ClientError> {
        self.login_mut(account_name)?.unblock_users(uris);
        self.next_state()
    }

    pub fn check_blocked_user(&self, account_name: &str, uri: &Uri) -> Result<bool, ClientError> {
        let login = self
            .logins
            .get(account_name)
            .ok_or_else(|| ClientError::no_such_entity(format!("login {account_name}")))?;
        Ok(login.check_blocked_user(uri))
    }

    pub fn set_audio_input_device(&mut self, device_id: &DeviceId) -> Result<(), ClientError> {
        if !self.capture_devices.iter().any(|d| &d.device_id == device_id) {
            return Err(ClientError::no_such_entity(format!(
                "capture device {device_id}"
            )));
        }
        self.input_device.set_desired(DevicePolicy::Specific {
            device_id: device_id.clone(),
        });
        self.next_state()
    }

    pub fn set_audio_output_device(&mut self, device_id: &DeviceId) -> Result<(), ClientError> {
        if !self.render_devices.iter().any(|d| &d.device_id == device_id) {
            return Err(ClientError::no_such_entity(format!(
                "render device {device_id}"
            )));
        }
        self.output_device.set_desired(DevicePolicy::Specific {
            device_id: device_id.clone(),
        });
        self.next_state()
    }

    pub fn use_default_system_audio_input_device(&mut self) -> Result<(), ClientError> {
        self.input_device.set_desired(DevicePolicy::DefaultSystem);
        self.next_state()
    }

    pub fn use_default_system_audio_output_device(&mut self) -> Result<(), ClientError> {
        self.output_device.set_desired(DevicePolicy::DefaultSystem);
        self.next_state()
    }

    pub fn use_default_communication_audio_input_device(&mut self) -> Result<(), ClientError> {
        self.input_device
            .set_desired(DevicePolicy::DefaultCommunication);
        self.next_state()
    }

    pub fn use_default_communication_audio_output_device(&mut self) -> Result<(), ClientError> {
        self.output_device
            .set_desired(DevicePolicy::DefaultCommunication);
        self.next_state()
    }

    pub fn set_master_audio_input_device_volume(&mut self, level: u32) -> Result<(), ClientError> {
        validate_volume(level)?;
        self.master_input_volume.set_desired(level);
        self.next_state()
    }

    pub fn set_master_audio_output_device_volume(&mut self, level: u32) -> Result<(), ClientError> {
        validate_volume(level)?;
        self.master_output_volume.set_desired(level);
        self.next_state()
    }

    pub fn get_master_audio_input_device_volume(&self) -> u32 {
        *self.master_input_volume.current()
    }

    pub fn get_master_audio_output_device_volume(&self) -> u32 {
        *self.master_output_volume.current()
    }

    pub fn set_channel_audio_output_device_volume(
        &mut self,
        account_name: &str,
        channel_uri: &str,
        volume: u32,
    ) -> Result<(), ClientError> {
        validate_volume(volume)?;
        let uri = valid_uri(channel_uri)?;
        self.channel_mut(account_name, &uri)?
            .set_desired_render_volume(volume);
        self.next_state()
    }

    pub fn get_channel_audio_output_device_volume(
        &self,
        account_name: &str,
        channel_uri: &str,
    ) -> Result<u32, ClientError> {
        let uri = valid_uri(channel_uri)?;
        let login = self
            .logins
            .get(account_name)
            .ok_or_else(|| ClientError::no_such_entity(format!("login {account_name}")))?;
        let channel = login
            .session_group()
            .channel(&uri)
            .ok_or_else(|| ClientError::no_such_entity(format!("channel {uri}")))?;
        Ok(channel.render_volume())
    }

    pub fn set_participant_audio_output_device_volume_for_me(
        &mut self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        volume: u32,
    ) -> Result<(), ClientError> {
        validate_volume(volume)?;
        let channel_uri = valid_uri(channel_uri)?;
        let participant_uri = valid_uri(participant_uri)?;
        self.participant_mut(account_name, &channel_uri, &participant_uri)?
            .set_desired_volume_for_me(volume);
        self.next_state()
    }

    pub fn set_participant_mute_for_me(
        &mut self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        mute: bool,
    ) -> Result<(), ClientError> {
        let channel_uri = valid_uri(channel_uri)?;
        let participant_uri = valid_uri(participant_uri)?;
        self.participant_mut(account_name, &channel_uri, &participant_uri)?
            .set_desired_mute_for_me(mute);
        self.next_state()
    }

    pub fn set_participant_mute_for_all(
        &mut self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        mute: bool,
    ) -> Result<(), ClientError> {
        let channel_uri = valid_uri(channel_uri)?;
        let participant_uri = valid_uri(participant_uri)?;
        self.participant_mut(account_name, &channel_uri, &participant_uri)?
            .set_desired_mute_for_all(mute);
        self.next_state()
    }

    pub fn set_transmission_to_specific_channel(
        &mut self,
        account_name: &str,
        channel_uri: &str,
    ) -> Result<(), ClientError> {
        let uri = valid_uri(channel_uri)?;
        let login = self.login_mut(account_name)?;
        if login.session_group().channel(&uri).is_none() {
            return Err(ClientError::no_such_entity(format!("channel {uri}")));
        }
        login
            .session_group_mut()
            .set_desired_transmission(TransmissionPolicy::SpecificSession { channel_uri: uri });
        self.next_state()
    }

    pub fn set_transmission_to_all(&mut self, account_name: &str) -> Result<(), ClientError> {
        self.login_mut(account_name)?
            .session_group_mut()
            .set_desired_transmission(TransmissionPolicy::AllSessions);
        self.next_state()
    }

    pub fn set_transmission_to_none(&mut self, account_name: &str) -> Result<(), ClientError> {
        self.login_mut(account_name)?
            .session_group_mut()
            .set_desired_transmission(TransmissionPolicy::NoSession);
        self.next_state()
    }

    // ---- reconciliation ----------------------------------------------------

    /// The idempotent top-down pass: at most one corrective request per
    /// divergence, with transitional current states preventing re-issue.
    pub fn next_state(&mut self) -> Result<(), ClientError> {
        let Self {
            transport,
            ids,
            events,
            connector,
            logins,
            input_device,
            output_device,
            master_input_volume,
            master_output_volume,
            ..
        } = self;
        let mut ctx = ReconcileCtx {
            transport: transport.as_ref(),
            ids,
            events,
        };

        match connector.current_state {
            ConnectorState::Uninitialized
                if connector.desired_state == ConnectorState::Initialized =>
            {
                if let Some(server) = connector.desired_server.clone() {
                    connector.handle = ctx.ids.next_handle("co");
                    ctx.issue(RequestBody::ConnectorCreate {
                        connector_handle: connector.handle.clone(),
                        server_uri: server,
                        udp_port_range: connector.desired_ports,
                    })?;
                    connector.current_state = ConnectorState::Initializing;
                }
            }
            ConnectorState::Initialized
                if connector.desired_state == ConnectorState::Uninitialized
                    || connector.current_server != connector.desired_server =>
            {
                ctx.issue(RequestBody::ConnectorShutdown {
                    connector_handle: connector.handle.clone(),
                })?;
                connector.current_state = ConnectorState::Uninitializing;
            }
            _ => {}
        }

        if connector.current_state == ConnectorState::Initialized
            && connector.current_server == connector.desired_server
        {
            for login in logins.values_mut() {
                login.next_state(&mut ctx, &connector.handle)?;
            }
        }

        // Device and master-volume policy converge regardless of connector
        // state; neither needs a joined channel.
        if let Some(policy) = input_device.take_request() {
            ctx.issue(RequestBody::SetCaptureDevice { policy })?;
        }
        if let Some(policy) = output_device.take_request() {
            ctx.issue(RequestBody::SetRenderDevice { policy })?;
        }
        if let Some(level) = master_input_volume.take_request() {
            ctx.issue(RequestBody::SetMicLevel { level })?;
        }
        if let Some(level) = master_output_volume.take_request() {
            ctx.issue(RequestBody::SetSpeakerLevel { level })?;
        }
        Ok(())
    }

    // ---- dispatch ----------------------------------------------------------

    pub fn dispatch(&mut self, message: TransportMessage) {
        match message {
            TransportMessage::Response(response) => self.dispatch_response(response),
            TransportMessage::Event(event) => self.dispatch_event(event),
        }
        if let Err(err) = self.next_state() {
            warn!(%err, "reconciliation after dispatch failed");
        }
    }

    fn dispatch_response(&mut self, response: VoiceResponse) {
        let success = response.is_success();
        let status_code = response.status_code;
        let events = self.events.clone();
        match response.request.body {
            RequestBody::ConnectorCreate {
                connector_handle,
                server_uri,
                udp_port_range,
            } => {
                if connector_handle != self.connector.handle {
                    self.hook
                        .invariant_failed("connector create response for unknown handle");
                    return;
                }
                if success {
                    self.connector.current_state = ConnectorState::Initialized;
                    self.connector.current_server = Some(server_uri);
                    self.connector.current_ports = udp_port_range;
                    info!(connector = %self.connector.handle, "connector initialized");
                    events.emit(ClientEvent::ConnectCompleted);
                } else {
                    let wanted_down =
                        self.connector.desired_state == ConnectorState::Uninitialized;
                    self.connector.reset();
                    self.logins.clear();
                    events.emit(ClientEvent::ConnectFailed { status_code });
                    // A disconnect requested mid-create still gets confirmed.
                    if wanted_down {
                        events.emit(ClientEvent::DisconnectCompleted);
                    }
                }
            }
            RequestBody::ConnectorShutdown { connector_handle } => {
                if connector_handle != self.connector.handle {
                    self.hook
                        .invariant_failed("connector shutdown response for unknown handle");
                    return;
                }
                self.connector.current_state = ConnectorState::Uninitialized;
                self.connector.current_server = None;
                self.logins.clear();
                events.emit(ClientEvent::DisconnectCompleted);
            }
            RequestBody::Login { account_handle, .. } => {
                match self.login_by_handle_mut(&account_handle) {
                    Some(login) => login.on_login_response(success, status_code, &events),
                    None => self
                        .hook
                        .invariant_failed("login response for unknown account handle"),
                }
            }
            RequestBody::Logout { account_handle } => {
                match self.login_by_handle_mut(&account_handle) {
                    Some(login) => login.on_logout_response(&events),
                    None => self
                        .hook
                        .invariant_failed("logout response for unknown account handle"),
                }
            }
            RequestBody::BlockUsers {
                account_handle,
                user_uris,
                block,
            } => match self.login_by_handle_mut(&account_handle) {
                Some(login) => login.on_block_response(success, &user_uris, block, status_code, &events),
                None => self
                    .hook
                    .invariant_failed("block response for unknown account handle"),
            },
            RequestBody::AddSession {
                session_group_handle,
                session_handle,
                ..
            } => {
                let handled = self.logins.values_mut().any(|login| {
                    if login.session_group().handle() != &session_group_handle {
                        return false;
                    }
                    let account = login.account_name().to_string();
                    login.session_group_mut().on_add_session_response(
                        &session_handle,
                        success,
                        status_code,
                        &account,
                        &events,
                    )
                });
                if !handled {
                    self.hook
                        .invariant_failed("add session response for unknown session");
                }
            }
            RequestBody::RemoveSession {
                session_group_handle,
                session_handle,
            } => {
                let handled = self.logins.values_mut().any(|login| {
                    if login.session_group().handle() != &session_group_handle {
                        return false;
                    }
                    let account = login.account_name().to_string();
                    login.session_group_mut().on_remove_session_response(
                        &session_handle,
                        success,
                        status_code,
                        &account,
                        &events,
                    )
                });
                if !handled {
                    self.hook
                        .invariant_failed("remove session response for unknown session");
                }
            }
            RequestBody::SetLocalRenderVolume {
                session_handle,
                volume,
            } => {
                let mut handled = false;
                for login in self.logins.values_mut() {
                    let account = login.account_name().to_string();
                    if let Some(channel) =
                        login.session_group_mut().channel_mut_by_session(&session_handle)
                    {
                        channel.on_render_volume_response(
                            success,
                            volume,
                            status_code,
                            &account,
                            &events,
                        );
                        handled = true;
                        break;
                    }
                }
                if !handled {
                    self.hook
                        .invariant_failed("render volume response for unknown session");
                }
            }
            RequestBody::SetParticipantVolumeForMe {
                session_handle,
                participant_uri,
                volume,
            } => {
                self.on_participant_response(&session_handle, &events, |account, channel| {
                    let channel_uri = channel.uri().clone();
                    let participant = channel.participant_mut(&participant_uri)?;
                    Some(match participant.complete_volume_for_me(success, volume) {
                        None => ClientEvent::ParticipantVolumeCompleted {
                            account: account.to_string(),
                            channel_uri,
                            participant_uri: participant_uri.clone(),
                            volume,
                        },
                        Some(rejected) => ClientEvent::ParticipantVolumeFailed {
                            account: account.to_string(),
                            channel_uri,
                            participant_uri: participant_uri.clone(),
                            volume: rejected,
                            status_code,
                        },
                    })
                });
            }
            RequestBody::SetParticipantMuteForMe {
                session_handle,
                participant_uri,
                mute,
            } => {
                self.on_participant_response(&session_handle, &events, |account, channel| {
                    let channel_uri = channel.uri().clone();
                    let participant = channel.participant_mut(&participant_uri)?;
                    Some(match participant.complete_mute_for_me(success, mute) {
                        None => ClientEvent::ParticipantMuteForMeCompleted {
                            account: account.to_string(),
                            channel_uri,
                            participant_uri: participant_uri.clone(),
                            muted: mute,
                        },
                        Some(rejected) => ClientEvent::ParticipantMuteForMeFailed {
                            account: account.to_string(),
                            channel_uri,
                            participant_uri: participant_uri.clone(),
                            muted: rejected,
                            status_code,
                        },
                    })
                });
            }
            RequestBody::SetParticipantMuteForAll {
                session_handle,
                participant_uri,
                mute,
            } => {
                self.on_participant_response(&session_handle, &events, |account, channel| {
                    let channel_uri = channel.uri().clone();
                    let participant = channel.participant_mut(&participant_uri)?;
                    Some(match participant.complete_mute_for_all(success, mute) {
                        None => ClientEvent::ParticipantMuteForAllCompleted {
                            account: account.to_string(),
                            channel_uri,
                            participant_uri: participant_uri.clone(),
                            muted: mute,
                        },
                        Some(rejected) => ClientEvent::ParticipantMuteForAllFailed {
                            account: account.to_string(),
                            channel_uri,
                            participant_uri: participant_uri.clone(),
                            muted: rejected,
                            status_code,
                        },
                    })
                });
            }
            RequestBody::SetTxSession {
                session_group_handle,
                channel_uri,
                ..
            } => {
                self.on_transmission_response(&session_group_handle, &events, |_| {
                    (
                        TransmissionPolicy::SpecificSession { channel_uri },
                        success,
                        status_code,
                    )
                });
            }
            RequestBody::SetTxAllSessions {
                session_group_handle,
            } => {
                self.on_transmission_response(&session_group_handle, &events, |_| {
                    (TransmissionPolicy::AllSessions, success, status_code)
                });
            }
            RequestBody::SetTxNoSession {
                session_group_handle,
            } => {
                self.on_transmission_response(&session_group_handle, &events, |_| {
                    (TransmissionPolicy::NoSession, success, status_code)
                });
            }
            RequestBody::SetCaptureDevice { policy } => {
                match self.input_device.complete(success, &policy) {
                    None => events.emit(ClientEvent::DeviceSelected {
                        direction: AudioDirection::Input,
                        policy,
                    }),
                    Some(rejected) => events.emit(ClientEvent::DeviceFailed {
                        direction: AudioDirection::Input,
                        policy: rejected,
                        status_code,
                    }),
                }
            }
            RequestBody::SetRenderDevice { policy } => {
                match self.output_device.complete(success, &policy) {
                    None => events.emit(ClientEvent::DeviceSelected {
                        direction: AudioDirection::Output,
                        policy,
                    }),
                    Some(rejected) => events.emit(ClientEvent::DeviceFailed {
                        direction: AudioDirection::Output,
                        policy: rejected,
                        status_code,
                    }),
                }
            }
            RequestBody::SetMicLevel { level } => {
                match self.master_input_volume.complete(success, &level) {
                    None => events.emit(ClientEvent::MasterVolumeCompleted {
                        direction: AudioDirection::Input,
                        level,
                    }),
                    Some(rejected) => events.emit(ClientEvent::MasterVolumeFailed {
                        direction: AudioDirection::Input,
                        level: rejected,
                        status_code,
                    }),
                }
            }
            RequestBody::SetSpeakerLevel { level } => {
                match self.master_output_volume.complete(success, &level) {
                    None => events.emit(ClientEvent::MasterVolumeCompleted {
                        direction: AudioDirection::Output,
                        level,
                    }),
                    Some(rejected) => events.emit(ClientEvent::MasterVolumeFailed {
                        direction: AudioDirection::Output,
                        level: rejected,
                        status_code,
                    }),
                }
            }
        }
    }

    fn dispatch_event(&mut self, event: VoiceEvent) {
        let events = self.events.clone();
        match event {
            VoiceEvent::AccountLoginStateChange {
                account_handle,
                state,
                status_code,
            } => match self.login_by_handle_mut(&account_handle) {
                Some(login) => login.on_login_state_event(state, status_code, &events),
                None => warn!(handle = %account_handle, "login state event for unknown account"),
            },
            VoiceEvent::ParticipantAdded {
                session_handle,
                participant_uri,
                display_name,
                is_current_user,
                ..
            } => {
                if !self.with_channel_by_session(&session_handle, |account, channel| {
                    channel.on_participant_added(
                        participant_uri.clone(),
                        display_name.clone(),
                        is_current_user,
                        account,
                        &events,
                    );
                }) {
                    warn!(handle = %session_handle, "participant added for unknown session");
                }
            }
            VoiceEvent::ParticipantUpdated {
                session_handle,
                participant_uri,
                is_muted_for_all,
                is_speaking,
                energy,
            } => {
                if !self.with_channel_by_session(&session_handle, |account, channel| {
                    channel.on_participant_updated(
                        participant_uri.clone(),
                        is_muted_for_all,
                        is_speaking,
                        energy,
                        account,
                        &events,
                    );
                }) {
                    warn!(handle = %session_handle, "participant update for unknown session");
                }
            }
            VoiceEvent::ParticipantRemoved {
                session_handle,
                participant_uri,
            } => {
                if !self.with_channel_by_session(&session_handle, |account, channel| {
                    channel.on_participant_removed(&participant_uri, account, &events);
                }) {
                    warn!(handle = %session_handle, "participant removed for unknown session");
                }
            }
            VoiceEvent::MediaStreamUpdated {
                session_handle,
                state,
                status_code,
                ..
            } => {
                use shared::protocol::MediaStreamState;
                match state {
                    MediaStreamState::Disconnected => {
                        if !self.with_channel_by_session(&session_handle, |account, channel| {
                            channel.on_media_stream_disconnected(status_code, account, &events);
                        }) {
                            warn!(handle = %session_handle, "media stream event for unknown session");
                        }
                    }
                    MediaStreamState::Connecting | MediaStreamState::Connected => {
                        debug!(handle = %session_handle, ?state, "media stream progress");
                    }
                }
            }
            VoiceEvent::AvailableDevicesChanged {
                capture_devices,
                render_devices,
            } => {
                self.capture_devices = capture_devices;
                self.render_devices = render_devices;
                events.emit(ClientEvent::AvailableDevicesChanged);
            }
            VoiceEvent::AudioFrame {
                stage,
                frame,
                sample_rate,
                channels,
            } => {
                events.emit(ClientEvent::AudioFrame {
                    stage,
                    frame,
                    sample_rate,
                    channels,
                });
            }
        }
    }

    // ---- lookup helpers ----------------------------------------------------

    fn login_mut(&mut self, account_name: &str) -> Result<&mut LoginManager, ClientError> {
        self.logins
            .get_mut(account_name)
            .ok_or_else(|| ClientError::no_such_entity(format!("login {account_name}")))
    }

    fn login_by_handle_mut(&mut self, handle: &Handle) -> Option<&mut LoginManager> {
        self.logins.values_mut().find(|login| login.handle() == handle)
    }

    fn channel_mut(
        &mut self,
        account_name: &str,
        channel_uri: &Uri,
    ) -> Result<&mut channel::Channel, ClientError> {
        self.login_mut(account_name)?
            .session_group_mut()
            .channel_mut(channel_uri)
            .ok_or_else(|| ClientError::no_such_entity(format!("channel {channel_uri}")))
    }

    fn participant_mut(
        &mut self,
        account_name: &str,
        channel_uri: &Uri,
        participant_uri: &Uri,
    ) -> Result<&mut participant::Participant, ClientError> {
        self.channel_mut(account_name, channel_uri)?
            .participant_mut(participant_uri)
            .ok_or_else(|| ClientError::no_such_entity(format!("participant {participant_uri}")))
    }

    fn with_channel_by_session(
        &mut self,
        session_handle: &Handle,
        mut apply: impl FnMut(&str, &mut channel::Channel),
    ) -> bool {
        for login in self.logins.values_mut() {
            let account = login.account_name().to_string();
            if let Some(channel) = login
                .session_group_mut()
                .channel_mut_by_session(session_handle)
            {
                apply(&account, channel);
                return true;
            }
        }
        false
    }

    fn on_participant_response(
        &mut self,
        session_handle: &Handle,
        events: &EventSink,
        mut build: impl FnMut(&str, &mut channel::Channel) -> Option<ClientEvent>,
    ) {
        let mut handled = false;
        for login in self.logins.values_mut() {
            let account = login.account_name().to_string();
            if let Some(channel) = login
                .session_group_mut()
                .channel_mut_by_session(session_handle)
            {
                if let Some(event) = build(&account, channel) {
                    events.emit(event);
                }
                handled = true;
                break;
            }
        }
        if !handled {
            self.hook
                .invariant_failed("participant response for unknown session");
        }
    }

    fn on_transmission_response(
        &mut self,
        session_group_handle: &Handle,
        events: &EventSink,
        build: impl FnOnce(&session_group::SessionGroup) -> (TransmissionPolicy, bool, i32),
    ) {
        let Some(login) = self
            .logins
            .values_mut()
            .find(|login| login.session_group().handle() == session_group_handle)
        else {
            self.hook
                .invariant_failed("transmission response for unknown session group");
            return;
        };
        let account = login.account_name().to_string();
        let (policy, success, status_code) = build(login.session_group());
        login
            .session_group_mut()
            .on_transmission_response(policy, success, status_code, &account, events);
    }
}

fn validate_volume(volume: u32) -> Result<(), ClientError> {
    if volume > MAX_VOLUME {
        return Err(ClientError::invalid_argument(format!(
            "volume {volume} outside 0..={MAX_VOLUME}"
        )));
    }
    Ok(())
}

fn valid_uri(raw: &str) -> Result<Uri, ClientError> {
    let uri = Uri::new(raw);
    if !uri.is_valid() {
        return Err(ClientError::invalid_argument("empty uri"));
    }
    Ok(uri)
}

// ---- async facade ----------------------------------------------------------

/// Serializes all access to the connection: public API calls from arbitrary
/// tasks and the transport pump both go through the one mutex, the Rust
/// rendition of "every inbound message is re-marshaled onto the app thread".
pub struct VoiceClient {
    inner: Mutex<ClientConnection>,
    events: EventSink,
    transport: Arc<dyn VoiceTransport>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceClient {
    pub fn new(transport: Arc<dyn VoiceTransport>, config: ClientConfig) -> Arc<Self> {
        let connection = ClientConnection::new(Arc::clone(&transport), config);
        let events = connection.event_sink();
        Arc::new(Self {
            inner: Mutex::new(connection),
            events,
            transport,
            pump: Mutex::new(None),
        })
    }

    /// Starts the message pump draining the transport subscription. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return;
        }
        let mut messages = self.transport.subscribe();
        let client = Arc::clone(self);
        *pump = Some(tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        client.inner.lock().await.dispatch(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport pump lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Bounded wait for a matching client event; replaces the original's
    /// busy-wait message-queue pumping with a clear timeout error.
    pub async fn wait_for_event<F>(&self, wait: Duration, matches: F) -> anyhow::Result<ClientEvent>
    where
        F: FnMut(&ClientEvent) -> bool + Send,
    {
        Self::next_matching(self.events.subscribe(), wait, matches).await
    }

    /// The receiver is an argument so callers can subscribe before the
    /// action whose confirmation they wait on; a synchronous emit slips past
    /// a subscription made afterwards.
    async fn next_matching<F>(
        mut receiver: broadcast::Receiver<ClientEvent>,
        wait: Duration,
        mut matches: F,
    ) -> anyhow::Result<ClientEvent>
    where
        F: FnMut(&ClientEvent) -> bool + Send,
    {
        let matched = async {
            loop {
                match receiver.recv().await {
                    Ok(event) if matches(&event) => return Ok(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("event channel closed")
                    }
                }
            }
        };
        tokio::time::timeout(wait, matched)
            .await
            .context("timed out waiting for client event")?
    }

    /// Connects and waits for the initial device list, bounded by `wait`.
    pub async fn initialize(
        self: &Arc<Self>,
        server_uri: &str,
        udp_port_range: UdpPortRange,
        wait: Duration,
    ) -> anyhow::Result<()> {
        self.start().await;
        let receiver = self.events.subscribe();
        self.inner
            .lock()
            .await
            .connect(server_uri, udp_port_range)
            .context("connect failed")?;
        Self::next_matching(receiver, wait, |event| {
            matches!(event, ClientEvent::AvailableDevicesChanged)
        })
        .await
        .context("no initial device list")?;
        Ok(())
    }

    /// Disconnects and waits for shutdown confirmation, then stops the pump.
    pub async fn shutdown(&self, server_uri: &str, wait: Duration) -> anyhow::Result<()> {
        let receiver = self.events.subscribe();
        self.inner
            .lock()
            .await
            .disconnect(server_uri)
            .context("disconnect failed")?;
        Self::next_matching(receiver, wait, |event| {
            matches!(event, ClientEvent::DisconnectCompleted)
        })
        .await
        .context("shutdown not confirmed")?;
        self.stop().await;
        Ok(())
    }
}

/// Application-facing async surface.
#[async_trait]
pub trait VoiceClientHandle: Send + Sync {
    async fn connect(&self, server_uri: &str, udp_port_range: UdpPortRange)
        -> Result<(), ClientError>;
    async fn disconnect(&self, server_uri: &str) -> Result<(), ClientError>;
    async fn login(&self, account_name: &str, credentials: &str) -> Result<(), ClientError>;
    async fn logout(&self, account_name: &str) -> Result<(), ClientError>;
    async fn join_channel(
        &self,
        account_name: &str,
        channel_uri: &str,
        access_token: Option<String>,
        multi_channel: bool,
    ) -> Result<(), ClientError>;
    async fn leave_channel(&self, account_name: &str, channel_uri: &str) -> Result<(), ClientError>;
    async fn leave_all(&self, account_name: &str) -> Result<(), ClientError>;
    async fn block_users(&self, account_name: &str, uris: &[Uri]) -> Result<(), ClientError>;
    async fn unblock_users(&self, account_name: &str, uris: &[Uri]) -> Result<(), ClientError>;
    async fn check_blocked_user(&self, account_name: &str, uri: &Uri) -> Result<bool, ClientError>;
    async fn set_master_audio_input_device_volume(&self, level: u32) -> Result<(), ClientError>;
    async fn set_master_audio_output_device_volume(&self, level: u32) -> Result<(), ClientError>;
    async fn set_channel_audio_output_device_volume(
        &self,
        account_name: &str,
        channel_uri: &str,
        volume: u32,
    ) -> Result<(), ClientError>;
    async fn set_participant_audio_output_device_volume_for_me(
        &self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        volume: u32,
    ) -> Result<(), ClientError>;
    async fn set_participant_mute_for_me(
        &self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        mute: bool,
    ) -> Result<(), ClientError>;
    async fn set_participant_mute_for_all(
        &self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        mute: bool,
    ) -> Result<(), ClientError>;
    async fn set_audio_input_device(&self, device_id: &DeviceId) -> Result<(), ClientError>;
    async fn set_audio_output_device(&self, device_id: &DeviceId) -> Result<(), ClientError>;
    async fn use_default_system_audio_input_device(&self) -> Result<(), ClientError>;
    async fn use_default_system_audio_output_device(&self) -> Result<(), ClientError>;
    async fn use_default_communication_audio_input_device(&self) -> Result<(), ClientError>;
    async fn use_default_communication_audio_output_device(&self) -> Result<(), ClientError>;
    async fn get_master_audio_input_device_volume(&self) -> u32;
    async fn get_master_audio_output_device_volume(&self) -> u32;
    async fn get_channel_audio_output_device_volume(
        &self,
        account_name: &str,
        channel_uri: &str,
    ) -> Result<u32, ClientError>;
    async fn set_transmission_to_specific_channel(
        &self,
        account_name: &str,
        channel_uri: &str,
    ) -> Result<(), ClientError>;
    async fn set_transmission_to_all(&self, account_name: &str) -> Result<(), ClientError>;
    async fn set_transmission_to_none(&self, account_name: &str) -> Result<(), ClientError>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[async_trait]
impl VoiceClientHandle for Arc<VoiceClient> {
    async fn connect(
        &self,
        server_uri: &str,
        udp_port_range: UdpPortRange,
    ) -> Result<(), ClientError> {
        self.start().await;
        self.inner.lock().await.connect(server_uri, udp_port_range)
    }

    async fn disconnect(&self, server_uri: &str) -> Result<(), ClientError> {
        self.inner.lock().await.disconnect(server_uri)
    }

    async fn login(&self, account_name: &str, credentials: &str) -> Result<(), ClientError> {
        self.inner.lock().await.login(account_name, credentials)
    }

    async fn logout(&self, account_name: &str) -> Result<(), ClientError> {
        self.inner.lock().await.logout(account_name)
    }

    async fn join_channel(
        &self,
        account_name: &str,
        channel_uri: &str,
        access_token: Option<String>,
        multi_channel: bool,
    ) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .join_channel(account_name, channel_uri, access_token, multi_channel)
    }

    async fn leave_channel(&self, account_name: &str, channel_uri: &str) -> Result<(), ClientError> {
        self.inner.lock().await.leave_channel(account_name, channel_uri)
    }

    async fn leave_all(&self, account_name: &str) -> Result<(), ClientError> {
        self.inner.lock().await.leave_all(account_name)
    }

    async fn block_users(&self, account_name: &str, uris: &[Uri]) -> Result<(), ClientError> {
        self.inner.lock().await.block_users(account_name, uris)
    }

    async fn unblock_users(&self, account_name: &str, uris: &[Uri]) -> Result<(), ClientError> {
        self.inner.lock().await.unblock_users(account_name, uris)
    }

    async fn check_blocked_user(&self, account_name: &str, uri: &Uri) -> Result<bool, ClientError> {
        self.inner.lock().await.check_blocked_user(account_name, uri)
    }

    async fn set_master_audio_input_device_volume(&self, level: u32) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .set_master_audio_input_device_volume(level)
    }

    async fn set_master_audio_output_device_volume(&self, level: u32) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .set_master_audio_output_device_volume(level)
    }

    async fn set_channel_audio_output_device_volume(
        &self,
        account_name: &str,
        channel_uri: &str,
        volume: u32,
    ) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .set_channel_audio_output_device_volume(account_name, channel_uri, volume)
    }

    async fn set_participant_audio_output_device_volume_for_me(
        &self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        volume: u32,
    ) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .set_participant_audio_output_device_volume_for_me(
                account_name,
                channel_uri,
                participant_uri,
                volume,
            )
    }

    async fn set_participant_mute_for_me(
        &self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        mute: bool,
    ) -> Result<(), ClientError> {
        self.inner.lock().await.set_participant_mute_for_me(
            account_name,
            channel_uri,
            participant_uri,
            mute,
        )
    }

    async fn set_participant_mute_for_all(
        &self,
        account_name: &str,
        channel_uri: &str,
        participant_uri: &str,
        mute: bool,
    ) -> Result<(), ClientError> {
        self.inner.lock().await.set_participant_mute_for_all(
            account_name,
            channel_uri,
            participant_uri,
            mute,
        )
    }

    async fn set_audio_input_device(&self, device_id: &DeviceId) -> Result<(), ClientError> {
        self.inner.lock().await.set_audio_input_device(device_id)
    }

    async fn set_audio_output_device(&self, device_id: &DeviceId) -> Result<(), ClientError> {
        self.inner.lock().await.set_audio_output_device(device_id)
    }

    async fn use_default_system_audio_input_device(&self) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .use_default_system_audio_input_device()
    }

    async fn use_default_system_audio_output_device(&self) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .use_default_system_audio_output_device()
    }

    async fn use_default_communication_audio_input_device(&self) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .use_default_communication_audio_input_device()
    }

    async fn use_default_communication_audio_output_device(&self) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .use_default_communication_audio_output_device()
    }

    async fn get_master_audio_input_device_volume(&self) -> u32 {
        self.inner.lock().await.get_master_audio_input_device_volume()
    }

    async fn get_master_audio_output_device_volume(&self) -> u32 {
        self.inner
            .lock()
            .await
            .get_master_audio_output_device_volume()
    }

    async fn get_channel_audio_output_device_volume(
        &self,
        account_name: &str,
        channel_uri: &str,
    ) -> Result<u32, ClientError> {
        self.inner
            .lock()
            .await
            .get_channel_audio_output_device_volume(account_name, channel_uri)
    }

    async fn set_transmission_to_specific_channel(
        &self,
        account_name: &str,
        channel_uri: &str,
    ) -> Result<(), ClientError> {
        self.inner
            .lock()
            .await
            .set_transmission_to_specific_channel(account_name, channel_uri)
    }

    async fn set_transmission_to_all(&self, account_name: &str) -> Result<(), ClientError> {
        self.inner.lock().await.set_transmission_to_all(account_name)
    }

    async fn set_transmission_to_none(&self, account_name: &str) -> Result<(), ClientError> {
        self.inner.lock().await.set_transmission_to_none(account_name)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        VoiceClient::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
