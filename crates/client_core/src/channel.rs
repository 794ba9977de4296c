use std::collections::BTreeMap;

use shared::{
    domain::{ChannelState, Handle, Uri},
    error::ClientError,
    protocol::RequestBody,
};
use tracing::{debug, info};

use crate::{
    convergent::Convergent,
    events::{ClientEvent, EventSink},
    participant::Participant,
    ReconcileCtx,
};

pub const DEFAULT_RENDER_VOLUME: u32 = 50;

/// One joined voice channel: connection state machine, render volume, and
/// the participant map.
#[derive(Debug, Clone)]
pub struct Channel {
    uri: Uri,
    desired: ChannelState,
    current: ChannelState,
    session_handle: Handle,
    access_token: Option<String>,
    render_volume: Convergent<u32>,
    participants: BTreeMap<Uri, Participant>,
}

impl Channel {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            desired: ChannelState::Disconnected,
            current: ChannelState::Disconnected,
            session_handle: Handle::new(""),
            access_token: None,
            render_volume: Convergent::new(DEFAULT_RENDER_VOLUME),
            participants: BTreeMap::new(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn desired(&self) -> ChannelState {
        self.desired
    }

    pub fn current(&self) -> ChannelState {
        self.current
    }

    pub fn session_handle(&self) -> &Handle {
        &self.session_handle
    }

    pub fn render_volume(&self) -> u32 {
        *self.render_volume.current()
    }

    pub fn participant(&self, uri: &Uri) -> Option<&Participant> {
        self.participants.get(uri)
    }

    pub fn participant_mut(&mut self, uri: &Uri) -> Option<&mut Participant> {
        self.participants.get_mut(uri)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Joining again while pending only refreshes the token and desired
    /// state; the in-progress transition is never re-issued.
    pub fn set_desired_connected(&mut self, access_token: Option<String>) {
        self.desired = ChannelState::Connected;
        self.access_token = access_token;
    }

    pub fn set_desired_disconnected(&mut self) {
        self.desired = ChannelState::Disconnected;
    }

    pub fn set_desired_render_volume(&mut self, volume: u32) {
        self.render_volume.set_desired(volume);
    }

    pub fn wants_connect(&self) -> bool {
        self.desired == ChannelState::Connected && self.current == ChannelState::Disconnected
    }

    pub fn wants_disconnect(&self) -> bool {
        self.desired == ChannelState::Disconnected
            && matches!(
                self.current,
                ChannelState::Connecting | ChannelState::Connected
            )
    }

    /// Issues the add-session request with a fresh session handle. The
    /// access token is cleared only once the transport accepts the request,
    /// so a rejected submission retries with the token intact.
    pub fn begin_connect(
        &mut self,
        ctx: &mut ReconcileCtx<'_>,
        session_group_handle: &Handle,
    ) -> Result<(), ClientError> {
        self.session_handle = ctx.ids.next_handle("sess");
        ctx.issue(RequestBody::AddSession {
            session_group_handle: session_group_handle.clone(),
            session_handle: self.session_handle.clone(),
            channel_uri: self.uri.clone(),
            access_token: self.access_token.clone(),
            connect_audio: true,
            connect_text: false,
        })?;
        self.access_token = None;
        self.current = ChannelState::Connecting;
        Ok(())
    }

    pub fn begin_disconnect(
        &mut self,
        ctx: &mut ReconcileCtx<'_>,
        session_group_handle: &Handle,
    ) -> Result<(), ClientError> {
        ctx.issue(RequestBody::RemoveSession {
            session_group_handle: session_group_handle.clone(),
            session_handle: self.session_handle.clone(),
        })?;
        self.current = ChannelState::Disconnecting;
        Ok(())
    }

    /// Steady-state convergence once connected: render volume, then every
    /// participant with the session handle passed down explicitly.
    pub fn next_state_steady(&mut self, ctx: &mut ReconcileCtx<'_>) -> Result<(), ClientError> {
        if self.current != ChannelState::Connected {
            return Ok(());
        }
        if let Some(volume) = self.render_volume.take_request() {
            ctx.issue(RequestBody::SetLocalRenderVolume {
                session_handle: self.session_handle.clone(),
                volume,
            })?;
        }
        for participant in self.participants.values_mut() {
            participant.next_state(ctx, &self.session_handle)?;
        }
        Ok(())
    }

    pub fn on_render_volume_response(
        &mut self,
        success: bool,
        requested: u32,
        status_code: i32,
        account: &str,
        events: &EventSink,
    ) {
        match self.render_volume.complete(success, &requested) {
            None => events.emit(ClientEvent::ChannelVolumeCompleted {
                account: account.to_string(),
                channel_uri: self.uri.clone(),
                volume: requested,
            }),
            Some(rejected) => events.emit(ClientEvent::ChannelVolumeFailed {
                account: account.to_string(),
                channel_uri: self.uri.clone(),
                volume: rejected,
                status_code,
            }),
        }
    }

    /// A participant-added event naming the local user is the authoritative
    /// Connecting -> Connected signal; the add-session response only means
    /// the request was accepted.
    pub fn on_participant_added(
        &mut self,
        participant_uri: Uri,
        display_name: String,
        is_current_user: bool,
        account: &str,
        events: &EventSink,
    ) {
        if is_current_user {
            if self.current == ChannelState::Connecting {
                self.current = ChannelState::Connected;
                info!(account, channel = %self.uri, "channel connected");
                events.emit(ClientEvent::ChannelJoined {
                    account: account.to_string(),
                    channel_uri: self.uri.clone(),
                });
            }
            return;
        }
        self.participants
            .entry(participant_uri.clone())
            .or_insert_with(|| Participant::new(participant_uri.clone()));
        events.emit(ClientEvent::ParticipantAdded {
            account: account.to_string(),
            channel_uri: self.uri.clone(),
            participant_uri,
            display_name,
        });
    }

    /// Updates may race ahead of the corresponding added event; the entry is
    /// created lazily in that case. The update callback fires only when a
    /// tracked value actually changed.
    pub fn on_participant_updated(
        &mut self,
        participant_uri: Uri,
        is_muted_for_all: bool,
        is_speaking: bool,
        energy: f32,
        account: &str,
        events: &EventSink,
    ) {
        let participant = self
            .participants
            .entry(participant_uri.clone())
            .or_insert_with(|| Participant::new(participant_uri.clone()));
        let mut changed = participant.set_muted_for_all(is_muted_for_all);
        changed |= participant.set_is_speaking(is_speaking);
        changed |= participant.set_energy(energy);
        if changed {
            events.emit(ClientEvent::ParticipantUpdated {
                account: account.to_string(),
                channel_uri: self.uri.clone(),
                participant_uri,
                is_muted_for_all,
                is_speaking,
                energy,
            });
        }
    }

    pub fn on_participant_removed(
        &mut self,
        participant_uri: &Uri,
        account: &str,
        events: &EventSink,
    ) {
        if self.participants.remove(participant_uri).is_some() {
            events.emit(ClientEvent::ParticipantLeft {
                account: account.to_string(),
                channel_uri: self.uri.clone(),
                participant_uri: participant_uri.clone(),
            });
        } else {
            debug!(participant = %participant_uri, "remove for untracked participant");
        }
    }

    /// Media stream reported disconnected. A nonzero status while we still
    /// wanted to be connected is a connection failure and rolls desired back
    /// too; a zero status is a normal, locally initiated leave.
    pub fn on_media_stream_disconnected(
        &mut self,
        status_code: i32,
        account: &str,
        events: &EventSink,
    ) {
        let was_connecting = self.current == ChannelState::Connecting;
        let failed = status_code != 0 && self.desired == ChannelState::Connected;
        self.current = ChannelState::Disconnected;
        self.participants.clear();
        if failed {
            self.desired = ChannelState::Disconnected;
            if was_connecting {
                events.emit(ClientEvent::ChannelJoinFailed {
                    account: account.to_string(),
                    channel_uri: self.uri.clone(),
                    status_code,
                });
                return;
            }
        }
        events.emit(ClientEvent::ChannelExited {
            account: account.to_string(),
            channel_uri: self.uri.clone(),
            status_code,
        });
    }
}
