use std::collections::BTreeMap;

use shared::{
    domain::{ChannelState, Handle, TransmissionPolicy, Uri},
    error::ClientError,
    protocol::RequestBody,
};
use tracing::debug;

use crate::{
    channel::Channel,
    convergent::Convergent,
    events::{ClientEvent, EventSink},
    ReconcileCtx,
};

/// The set of channels for one logged-in account, plus transmission-policy
/// arbitration. Channels are keyed by URI in a BTreeMap so "the first channel
/// wanting to connect" is deterministic.
#[derive(Debug, Clone)]
pub struct SessionGroup {
    handle: Handle,
    channels: BTreeMap<Uri, Channel>,
    transmission: Convergent<TransmissionPolicy>,
}

impl SessionGroup {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            channels: BTreeMap::new(),
            transmission: Convergent::new(TransmissionPolicy::AllSessions),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn channel(&self, uri: &Uri) -> Option<&Channel> {
        self.channels.get(uri)
    }

    pub fn channel_mut(&mut self, uri: &Uri) -> Option<&mut Channel> {
        self.channels.get_mut(uri)
    }

    pub fn channel_mut_by_session(&mut self, session_handle: &Handle) -> Option<&mut Channel> {
        self.channels
            .values_mut()
            .find(|channel| channel.session_handle() == session_handle)
    }

    pub fn uri_by_session(&self, session_handle: &Handle) -> Option<Uri> {
        self.channels
            .values()
            .find(|channel| channel.session_handle() == session_handle)
            .map(|channel| channel.uri().clone())
    }

    pub fn transmission_policy(&self) -> &TransmissionPolicy {
        self.transmission.current()
    }

    /// Join is implicitly exclusive unless multi-channel mode is enabled:
    /// every other channel in the group is told to leave first.
    pub fn join_channel(&mut self, uri: Uri, access_token: Option<String>, multi_channel: bool) {
        if !multi_channel {
            for (other_uri, other) in self.channels.iter_mut() {
                if *other_uri != uri {
                    other.set_desired_disconnected();
                }
            }
        }
        self.channels
            .entry(uri.clone())
            .or_insert_with(|| Channel::new(uri))
            .set_desired_connected(access_token);
    }

    pub fn leave_channel(&mut self, uri: &Uri) -> Result<(), ClientError> {
        let channel = self
            .channels
            .get_mut(uri)
            .ok_or_else(|| ClientError::no_such_entity(format!("channel {uri}")))?;
        channel.set_desired_disconnected();
        Ok(())
    }

    pub fn leave_all(&mut self) {
        for channel in self.channels.values_mut() {
            channel.set_desired_disconnected();
        }
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn set_desired_transmission(&mut self, policy: TransmissionPolicy) {
        self.transmission.set_desired(policy);
    }

    /// Session-group reconciliation. Pending disconnects always drain;
    /// connects are serialized, one at a time, and never overlap a
    /// disconnect still in progress within the group.
    pub fn next_state(&mut self, ctx: &mut ReconcileCtx<'_>) -> Result<(), ClientError> {
        let handle = self.handle.clone();
        for channel in self.channels.values_mut() {
            if channel.wants_disconnect() {
                channel.begin_disconnect(ctx, &handle)?;
            }
        }

        let mid_connect = self
            .channels
            .values()
            .any(|channel| channel.current() == ChannelState::Connecting);
        let mid_disconnect = self
            .channels
            .values()
            .any(|channel| channel.current() == ChannelState::Disconnecting);
        if !mid_connect && !mid_disconnect {
            if let Some(channel) = self.channels.values_mut().find(|c| c.wants_connect()) {
                channel.begin_connect(ctx, &handle)?;
                // Joining re-arms transmit-to-all for the whole group. Going
                // through the convergent keeps the single in-flight guard
                // honest when another policy change is still outstanding.
                self.transmission
                    .set_desired(TransmissionPolicy::AllSessions);
            }
        }

        if let Some(policy) = self.transmission.take_request() {
            let body = match &policy {
                TransmissionPolicy::NoSession => RequestBody::SetTxNoSession {
                    session_group_handle: handle.clone(),
                },
                TransmissionPolicy::AllSessions => RequestBody::SetTxAllSessions {
                    session_group_handle: handle.clone(),
                },
                TransmissionPolicy::SpecificSession { channel_uri } => {
                    let session_handle = self
                        .channels
                        .get(channel_uri)
                        .map(|channel| channel.session_handle().clone())
                        .unwrap_or_else(|| Handle::new(""));
                    RequestBody::SetTxSession {
                        session_group_handle: handle.clone(),
                        session_handle,
                        channel_uri: channel_uri.clone(),
                    }
                }
            };
            ctx.issue(body)?;
        }

        for channel in self.channels.values_mut() {
            channel.next_state_steady(ctx)?;
        }
        Ok(())
    }

    /// Returns false when no channel owns the session handle any more.
    pub fn on_add_session_response(
        &mut self,
        session_handle: &Handle,
        success: bool,
        status_code: i32,
        account: &str,
        events: &EventSink,
    ) -> bool {
        let Some(uri) = self.uri_by_session(session_handle) else {
            return false;
        };
        if success {
            // Request accepted; the self participant-added event confirms
            // the actual connection.
            return true;
        }
        let Some(channel) = self.channels.remove(&uri) else {
            return false;
        };
        if channel.desired() == ChannelState::Connected {
            events.emit(ClientEvent::ChannelJoinFailed {
                account: account.to_string(),
                channel_uri: uri,
                status_code,
            });
        } else {
            debug!(channel = %uri, "add session failed after join was cancelled");
        }
        true
    }

    pub fn on_remove_session_response(
        &mut self,
        session_handle: &Handle,
        success: bool,
        status_code: i32,
        account: &str,
        events: &EventSink,
    ) -> bool {
        let Some(uri) = self.uri_by_session(session_handle) else {
            return false;
        };
        if success {
            // The media-stream disconnected event finalizes the state.
            return true;
        }
        let desired = match self.channels.get(&uri) {
            Some(channel) => channel.desired(),
            None => return false,
        };
        if desired == ChannelState::Connected {
            // A rejoin raced the teardown; drop the stale entry so the next
            // pass recreates the session from scratch.
            self.channels.remove(&uri);
        } else if let Some(channel) = self.channels.get_mut(&uri) {
            channel.on_media_stream_disconnected(status_code, account, events);
        }
        true
    }

    pub fn on_transmission_response(
        &mut self,
        requested: TransmissionPolicy,
        success: bool,
        status_code: i32,
        account: &str,
        events: &EventSink,
    ) {
        match self.transmission.complete(success, &requested) {
            None => events.emit(ClientEvent::TransmissionChanged {
                account: account.to_string(),
                policy: requested,
            }),
            Some(rejected) => events.emit(ClientEvent::TransmissionFailed {
                account: account.to_string(),
                policy: rejected,
                status_code,
            }),
        }
    }
}
