use std::sync::Mutex as StdMutex;

use shared::domain::{ChannelState, LoginState};
use shared::error::status;
use shared::protocol::MediaStreamState;
use transport::TransportError;

use super::*;

const SERVER: &str = "https://voice.example.com";
const PORTS: UdpPortRange = UdpPortRange {
    min: 40000,
    max: 40100,
};

/// Records every issued request and exposes the broadcast side for injecting
/// responses and events, standing in for the real backend.
struct RecordingTransport {
    requests: StdMutex<Vec<VoiceRequest>>,
    messages: broadcast::Sender<TransportMessage>,
    reject_next: StdMutex<bool>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        let (messages, _) = broadcast::channel(64);
        Arc::new(Self {
            requests: StdMutex::new(Vec::new()),
            messages,
            reject_next: StdMutex::new(false),
        })
    }

    fn take_requests(&self) -> Vec<VoiceRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    fn reject_next(&self) {
        *self.reject_next.lock().unwrap() = true;
    }
}

impl VoiceTransport for RecordingTransport {
    fn issue_request(&self, request: VoiceRequest) -> Result<(), TransportError> {
        if std::mem::take(&mut *self.reject_next.lock().unwrap()) {
            return Err(TransportError::Rejected("injected".into()));
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportMessage> {
        self.messages.subscribe()
    }
}

#[derive(Default)]
struct CountingHook(StdMutex<u32>);

impl CountingHook {
    fn count(&self) -> u32 {
        *self.0.lock().unwrap()
    }
}

impl InvariantHook for CountingHook {
    fn invariant_failed(&self, _message: &str) {
        *self.0.lock().unwrap() += 1;
    }
}

fn only_request(
    requests: Vec<VoiceRequest>,
    pred: impl Fn(&RequestBody) -> bool,
) -> VoiceRequest {
    let mut matched: Vec<VoiceRequest> =
        requests.into_iter().filter(|r| pred(&r.body)).collect();
    assert_eq!(matched.len(), 1, "expected exactly one matching request");
    matched.remove(0)
}

fn count_events(events: &[ClientEvent], pred: impl Fn(&ClientEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

struct Harness {
    transport: Arc<RecordingTransport>,
    connection: ClientConnection,
    events: broadcast::Receiver<ClientEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_connection(|transport| {
            ClientConnection::new(transport, ClientConfig::default())
        })
    }

    fn with_connection(
        build: impl FnOnce(Arc<dyn VoiceTransport>) -> ClientConnection,
    ) -> Self {
        let transport = RecordingTransport::new();
        let connection = build(transport.clone());
        let events = connection.subscribe_events();
        Self {
            transport,
            connection,
            events,
        }
    }

    fn respond(&mut self, request: VoiceRequest, status_code: i32) {
        self.connection
            .dispatch(TransportMessage::Response(VoiceResponse {
                request,
                status_code,
            }));
    }

    fn respond_ok(&mut self, request: VoiceRequest) {
        self.respond(request, status::OK);
    }

    fn inject(&mut self, event: VoiceEvent) {
        self.connection.dispatch(TransportMessage::Event(event));
    }

    fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn connect(&mut self) {
        self.connection.connect(SERVER, PORTS).unwrap();
        let create = only_request(self.transport.take_requests(), |b| {
            matches!(b, RequestBody::ConnectorCreate { .. })
        });
        self.respond_ok(create);
        self.drain_events();
    }

    /// Connects if needed, logs in, and confirms; returns the account handle.
    fn login(&mut self, account: &str) -> Handle {
        self.connection.login(account, "secret").unwrap();
        let login = only_request(self.transport.take_requests(), |b| {
            matches!(b, RequestBody::Login { .. })
        });
        let RequestBody::Login { account_handle, .. } = login.body.clone() else {
            unreachable!()
        };
        self.respond_ok(login);
        self.drain_events();
        account_handle
    }

    /// Joins a channel and drives it all the way to connected; returns the
    /// session handle.
    fn join(&mut self, account: &str, channel_uri: &str) -> Handle {
        self.connection
            .join_channel(account, channel_uri, None, true)
            .unwrap();
        let add = only_request(self.transport.take_requests(), |b| {
            matches!(b, RequestBody::AddSession { .. })
        });
        let RequestBody::AddSession { session_handle, .. } = add.body.clone() else {
            unreachable!()
        };
        self.respond_ok(add);
        self.inject(VoiceEvent::ParticipantAdded {
            session_handle: session_handle.clone(),
            participant_uri: Uri::new(format!("sip:{account}@example.com")),
            account_name: account.to_string(),
            display_name: account.to_string(),
            is_current_user: true,
        });
        self.transport.take_requests();
        self.drain_events();
        session_handle
    }

    fn add_participant(&mut self, session_handle: &Handle, participant_uri: &str) {
        self.inject(VoiceEvent::ParticipantAdded {
            session_handle: session_handle.clone(),
            participant_uri: Uri::new(participant_uri),
            account_name: participant_uri.to_string(),
            display_name: participant_uri.to_string(),
            is_current_user: false,
        });
        self.drain_events();
    }

    fn channel(&self, account: &str, uri: &str) -> Option<&channel::Channel> {
        self.connection
            .account(account)?
            .session_group()
            .channel(&Uri::new(uri))
    }
}

// ---- connector lifecycle ----------------------------------------------------

#[test]
fn connect_issues_one_request_and_completes_once() {
    let mut h = Harness::new();
    h.connection.connect(SERVER, PORTS).unwrap();
    let create = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::ConnectorCreate { .. })
    });

    // Re-connecting to the same server while pending is a no-op.
    h.connection.connect(SERVER, PORTS).unwrap();
    assert!(h.transport.take_requests().is_empty());

    h.respond_ok(create);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::ConnectCompleted)),
        1
    );
    assert_eq!(h.connection.connector_state(), ConnectorState::Initialized);
}

#[test]
fn connect_rejects_unparseable_server_uri() {
    let mut h = Harness::new();
    let err = h.connection.connect("not a uri", PORTS).unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));
    assert!(h.transport.take_requests().is_empty());
}

#[test]
fn connector_create_failure_resets_everything() {
    let mut h = Harness::new();
    h.connection.connect(SERVER, PORTS).unwrap();
    let create = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::ConnectorCreate { .. })
    });
    h.respond(create, 500);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::ConnectFailed { status_code: 500 }
        )),
        1
    );
    assert_eq!(
        h.connection.connector_state(),
        ConnectorState::Uninitialized
    );
}

#[test]
fn disconnect_for_unknown_server_routes_to_invariant_hook() {
    let hook = Arc::new(CountingHook::default());
    let hook_probe = Arc::clone(&hook);
    let mut h = Harness::with_connection(move |transport| {
        ClientConnection::with_hook(transport, ClientConfig::default(), hook)
    });
    h.connect();
    h.connection.disconnect("https://other.example.com").unwrap();
    assert!(h.transport.take_requests().is_empty());
    assert_eq!(hook_probe.count(), 1);
}

#[test]
fn repeated_disconnect_confirms_without_new_request() {
    let mut h = Harness::new();
    h.connect();
    h.connection.disconnect(SERVER).unwrap();
    let shutdown = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::ConnectorShutdown { .. })
    });
    h.respond_ok(shutdown);
    h.drain_events();

    // Already down; confirmation must not depend on a backend round trip.
    h.connection.disconnect(SERVER).unwrap();
    assert!(h.transport.take_requests().is_empty());
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::DisconnectCompleted)),
        1
    );
}

#[test]
fn disconnect_during_failed_connect_still_confirms() {
    let mut h = Harness::new();
    h.connection.connect(SERVER, PORTS).unwrap();
    let create = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::ConnectorCreate { .. })
    });

    // Mid-create there is nothing to shut down yet.
    h.connection.disconnect(SERVER).unwrap();
    assert!(h.transport.take_requests().is_empty());
    assert!(h.drain_events().is_empty());

    h.respond(create, 500);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::ConnectFailed { .. })),
        1
    );
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::DisconnectCompleted)),
        1
    );
}

#[test]
fn disconnect_round_trip_emits_completed() {
    let mut h = Harness::new();
    h.connect();
    h.connection.disconnect(SERVER).unwrap();
    let shutdown = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::ConnectorShutdown { .. })
    });
    h.respond_ok(shutdown);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::DisconnectCompleted)),
        1
    );
    assert_eq!(
        h.connection.connector_state(),
        ConnectorState::Uninitialized
    );
}

// ---- login ------------------------------------------------------------------

#[test]
fn login_requires_a_desired_server() {
    let mut h = Harness::new();
    let err = h.connection.login("alice", "secret").unwrap_err();
    assert!(matches!(err, ClientError::NotConnected(_)));
}

#[test]
fn login_rejects_empty_account_name() {
    let mut h = Harness::new();
    h.connect();
    let err = h.connection.login("", "secret").unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));
}

#[test]
fn login_round_trip_emits_completed_once() {
    let mut h = Harness::new();
    h.connect();
    h.connection.login("alice", "secret").unwrap();
    let login = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::Login { .. })
    });

    // Repeated login while pending issues nothing new.
    h.connection.login("alice", "secret").unwrap();
    assert!(h.transport.take_requests().is_empty());

    h.respond_ok(login);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::LoginCompleted { .. })),
        1
    );
    assert_eq!(
        h.connection.account("alice").unwrap().current(),
        LoginState::LoggedIn
    );
}

#[test]
fn second_login_logs_previous_account_out() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    h.connection.login("bob", "hunter2").unwrap();
    let requests = h.transport.take_requests();
    let logout = only_request(requests.clone(), |b| matches!(b, RequestBody::Logout { .. }));
    let RequestBody::Logout { account_handle } = logout.body else {
        unreachable!()
    };
    assert_eq!(
        &account_handle,
        h.connection.account("alice").unwrap().handle()
    );
    only_request(requests, |b| {
        matches!(b, RequestBody::Login { account_name, .. } if account_name == "bob")
    });
}

#[test]
fn network_logout_relogs_in_exactly_once() {
    let mut h = Harness::new();
    h.connect();
    let account_handle = h.login("alice");

    h.inject(VoiceEvent::AccountLoginStateChange {
        account_handle: account_handle.clone(),
        state: LoginState::LoggedOut,
        status_code: status::NETWORK_UNREACHABLE,
    });
    only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::Login { .. })
    });
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::LoginFailed { .. })),
        0
    );

    // A second network logout during the retry gives up.
    h.inject(VoiceEvent::AccountLoginStateChange {
        account_handle,
        state: LoginState::LoggedOut,
        status_code: status::NETWORK_UNREACHABLE,
    });
    assert!(h.transport.take_requests().is_empty());
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::LoginFailed { .. })),
        1
    );
    assert_eq!(
        h.connection.account("alice").unwrap().desired(),
        LoginState::LoggedOut
    );
}

// ---- channels ---------------------------------------------------------------

#[test]
fn join_issues_one_add_session_and_connects_on_self_event() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    h.connection.join_channel("alice", uri, None, true).unwrap();
    let add = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::AddSession { .. })
    });

    // Joining again while the first join is pending issues nothing.
    h.connection.join_channel("alice", uri, None, true).unwrap();
    assert!(h
        .transport
        .take_requests()
        .iter()
        .all(|r| !matches!(r.body, RequestBody::AddSession { .. })));

    let RequestBody::AddSession { session_handle, .. } = add.body.clone() else {
        unreachable!()
    };
    h.respond_ok(add);
    // Acceptance alone is not a join; the self participant event is.
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::ChannelJoined { .. })),
        0
    );

    h.inject(VoiceEvent::ParticipantAdded {
        session_handle,
        participant_uri: Uri::new("sip:alice@example.com"),
        account_name: "alice".into(),
        display_name: "alice".into(),
        is_current_user: true,
    });
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::ChannelJoined { .. })),
        1
    );
    assert_eq!(
        h.channel("alice", uri).unwrap().current(),
        ChannelState::Connected
    );
}

#[test]
fn rejected_add_session_erases_the_channel() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    h.connection.join_channel("alice", uri, None, true).unwrap();
    let add = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::AddSession { .. })
    });
    h.respond(add, 403);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::ChannelJoinFailed {
                status_code: 403,
                ..
            }
        )),
        1
    );
    assert!(h.channel("alice", uri).is_none());
}

#[test]
fn leave_emits_exited_once_and_clears_participants() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    let session = h.join("alice", uri);
    h.add_participant(&session, "sip:bob@example.com");

    h.connection.leave_channel("alice", uri).unwrap();
    let remove = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::RemoveSession { .. })
    });
    h.respond_ok(remove);
    h.inject(VoiceEvent::MediaStreamUpdated {
        session_group_handle: Handle::new(""),
        session_handle: session,
        state: MediaStreamState::Disconnected,
        status_code: 0,
    });
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::ChannelExited { status_code: 0, .. }
        )),
        1
    );
    let channel = h.channel("alice", uri).unwrap();
    assert_eq!(channel.current(), ChannelState::Disconnected);
    assert_eq!(channel.participant_count(), 0);
}

#[test]
fn leave_unknown_channel_is_no_such_entity() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let err = h
        .connection
        .leave_channel("alice", "sip:nowhere@example.com")
        .unwrap_err();
    assert!(matches!(err, ClientError::NoSuchEntity(_)));
}

#[test]
fn media_failure_while_connected_rolls_desired_back() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    let session = h.join("alice", uri);

    h.inject(VoiceEvent::MediaStreamUpdated {
        session_group_handle: Handle::new(""),
        session_handle: session,
        state: MediaStreamState::Disconnected,
        status_code: status::NETWORK_UNREACHABLE,
    });
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::ChannelExited { .. })),
        1
    );
    // Desired rolled back with current, so nothing tries to rejoin.
    assert!(h
        .transport
        .take_requests()
        .iter()
        .all(|r| !matches!(r.body, RequestBody::AddSession { .. })));
    assert_eq!(
        h.channel("alice", uri).unwrap().desired(),
        ChannelState::Disconnected
    );
}

#[test]
fn exclusive_join_drains_old_channel_before_connecting_new() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri_a = "sip:confctl-alpha@example.com";
    let uri_b = "sip:confctl-beta@example.com";
    let session_a = h.join("alice", uri_a);

    h.connection
        .join_channel("alice", uri_b, None, false)
        .unwrap();
    let requests = h.transport.take_requests();
    let remove = only_request(requests.clone(), |b| {
        matches!(b, RequestBody::RemoveSession { .. })
    });
    assert!(requests
        .iter()
        .all(|r| !matches!(r.body, RequestBody::AddSession { .. })));

    // The accepted teardown still waits for the media stream to drop.
    h.respond_ok(remove);
    assert!(h
        .transport
        .take_requests()
        .iter()
        .all(|r| !matches!(r.body, RequestBody::AddSession { .. })));

    h.inject(VoiceEvent::MediaStreamUpdated {
        session_group_handle: Handle::new(""),
        session_handle: session_a,
        state: MediaStreamState::Disconnected,
        status_code: 0,
    });
    only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::AddSession { channel_uri, .. } if channel_uri.as_str() == uri_b)
    });
}

#[test]
fn join_retry_after_transport_rejection_keeps_access_token() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");

    h.transport.reject_next();
    let err = h
        .connection
        .join_channel(
            "alice",
            "sip:confctl-room@example.com",
            Some("token".into()),
            true,
        )
        .unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));

    // The next pass retries with the token still attached.
    h.connection.next_state().unwrap();
    only_request(h.transport.take_requests(), |b| {
        matches!(
            b,
            RequestBody::AddSession {
                access_token: Some(token),
                ..
            } if token == "token"
        )
    });
}

// ---- participants -----------------------------------------------------------

#[test]
fn participant_updates_fire_only_on_change() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let session = h.join("alice", "sip:confctl-room@example.com");
    h.add_participant(&session, "sip:bob@example.com");

    h.inject(VoiceEvent::ParticipantUpdated {
        session_handle: session.clone(),
        participant_uri: Uri::new("sip:bob@example.com"),
        is_muted_for_all: false,
        is_speaking: true,
        energy: 0.6,
    });
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::ParticipantUpdated {
                is_speaking: true,
                ..
            }
        )),
        1
    );

    // Identical payload again changes nothing.
    h.inject(VoiceEvent::ParticipantUpdated {
        session_handle: session.clone(),
        participant_uri: Uri::new("sip:bob@example.com"),
        is_muted_for_all: false,
        is_speaking: true,
        energy: 0.6,
    });
    assert!(h.drain_events().is_empty());

    h.inject(VoiceEvent::ParticipantRemoved {
        session_handle: session,
        participant_uri: Uri::new("sip:bob@example.com"),
    });
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(e, ClientEvent::ParticipantLeft { .. })),
        1
    );
}

#[test]
fn participant_volume_keeps_latest_intent_across_inflight_response() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    let session = h.join("alice", uri);
    h.add_participant(&session, "sip:bob@example.com");

    h.connection
        .set_participant_audio_output_device_volume_for_me(
            "alice",
            uri,
            "sip:bob@example.com",
            60,
        )
        .unwrap();
    let first = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetParticipantVolumeForMe { volume: 60, .. })
    });

    // Second intent while the first is outstanding; no extra request yet.
    h.connection
        .set_participant_audio_output_device_volume_for_me(
            "alice",
            uri,
            "sip:bob@example.com",
            70,
        )
        .unwrap();
    assert!(h.transport.take_requests().is_empty());

    // The confirmed response frees the slot and the newer value goes out.
    h.respond_ok(first);
    only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetParticipantVolumeForMe { volume: 70, .. })
    });
}

#[test]
fn participant_mute_for_me_round_trip() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    let session = h.join("alice", uri);
    h.add_participant(&session, "sip:bob@example.com");

    h.connection
        .set_participant_mute_for_me("alice", uri, "sip:bob@example.com", true)
        .unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetParticipantMuteForMe { mute: true, .. })
    });
    h.respond_ok(request);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::ParticipantMuteForMeCompleted { muted: true, .. }
        )),
        1
    );
    let participant = h
        .channel("alice", uri)
        .unwrap()
        .participant(&Uri::new("sip:bob@example.com"))
        .unwrap();
    assert!(participant.is_muted_for_me());
}

// ---- volumes ----------------------------------------------------------------

#[test]
fn master_volume_validates_then_converges() {
    let mut h = Harness::new();
    let err = h
        .connection
        .set_master_audio_input_device_volume(150)
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));
    assert!(h.transport.take_requests().is_empty());

    h.connection.set_master_audio_input_device_volume(75).unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetMicLevel { level: 75 })
    });
    h.respond_ok(request);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::MasterVolumeCompleted {
                direction: AudioDirection::Input,
                level: 75,
            }
        )),
        1
    );
    assert_eq!(h.connection.get_master_audio_input_device_volume(), 75);
}

#[test]
fn channel_volume_failure_reverts_to_confirmed_value() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    h.join("alice", uri);

    h.connection
        .set_channel_audio_output_device_volume("alice", uri, 75)
        .unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetLocalRenderVolume { volume: 75, .. })
    });
    h.respond_ok(request);
    assert_eq!(
        h.connection
            .get_channel_audio_output_device_volume("alice", uri)
            .unwrap(),
        75
    );

    h.connection
        .set_channel_audio_output_device_volume("alice", uri, 30)
        .unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetLocalRenderVolume { volume: 30, .. })
    });
    h.respond(request, 1);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::ChannelVolumeFailed { volume: 30, .. }
        )),
        1
    );
    assert_eq!(
        h.connection
            .get_channel_audio_output_device_volume("alice", uri)
            .unwrap(),
        75
    );
}

// ---- transmission -----------------------------------------------------------

#[test]
fn transmission_failure_leaves_policy_unchanged() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    h.connection.set_transmission_to_none("alice").unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetTxNoSession { .. })
    });
    h.respond(request, 1);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::TransmissionFailed { .. }
        )),
        1
    );
    assert_eq!(
        h.connection
            .account("alice")
            .unwrap()
            .session_group()
            .transmission_policy(),
        &TransmissionPolicy::AllSessions
    );
}

#[test]
fn transmission_to_specific_channel_targets_its_session() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    let session = h.join("alice", uri);

    h.connection
        .set_transmission_to_specific_channel("alice", uri)
        .unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetTxSession { .. })
    });
    let RequestBody::SetTxSession { session_handle, .. } = request.body.clone() else {
        unreachable!()
    };
    assert_eq!(session_handle, session);
    h.respond_ok(request);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::TransmissionChanged {
                policy: TransmissionPolicy::SpecificSession { .. },
                ..
            }
        )),
        1
    );
}

#[test]
fn join_rearms_transmit_all_without_breaking_inflight_guard() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    h.join("alice", "sip:confctl-alpha@example.com");

    h.connection.set_transmission_to_none("alice").unwrap();
    let pending = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetTxNoSession { .. })
    });

    // A join lands while the policy change is still outstanding; nothing
    // else may go out until the pending response clears the guard.
    h.connection
        .join_channel("alice", "sip:confctl-beta@example.com", None, true)
        .unwrap();
    assert!(h.transport.take_requests().iter().all(|r| !matches!(
        r.body,
        RequestBody::SetTxNoSession { .. } | RequestBody::SetTxAllSessions { .. }
    )));

    h.respond_ok(pending);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::TransmissionChanged { .. }
        )),
        1
    );
    only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetTxAllSessions { .. })
    });
}

#[test]
fn transmission_response_keeps_requested_channel_when_entry_is_gone() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let uri = "sip:confctl-room@example.com";
    h.connection.join_channel("alice", uri, None, true).unwrap();
    let add = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::AddSession { .. })
    });

    h.connection
        .set_transmission_to_specific_channel("alice", uri)
        .unwrap();
    let tx = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetTxSession { .. })
    });

    // The join is rejected and the entry erased before the policy response.
    h.respond(add, 403);
    assert!(h.channel("alice", uri).is_none());

    h.respond_ok(tx);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::TransmissionChanged {
                policy: TransmissionPolicy::SpecificSession { channel_uri },
                ..
            } if channel_uri.as_str() == uri
        )),
        1
    );
    assert_eq!(
        h.connection
            .account("alice")
            .unwrap()
            .session_group()
            .transmission_policy(),
        &TransmissionPolicy::SpecificSession {
            channel_uri: Uri::new(uri),
        }
    );
}

// ---- block rules ------------------------------------------------------------

#[test]
fn block_rules_batch_into_one_request_per_direction() {
    let mut h = Harness::new();
    h.connect();
    h.login("alice");
    let ann = Uri::new("sip:ann@example.com");
    let bob = Uri::new("sip:bob@example.com");

    h.connection
        .block_users("alice", &[ann.clone(), bob.clone()])
        .unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(
            b,
            RequestBody::BlockUsers {
                user_uris,
                block: true,
                ..
            } if user_uris == "sip:ann@example.com\nsip:bob@example.com"
        )
    });
    h.respond_ok(request);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::BlockRuleApplied { blocked: true, .. }
        )),
        1
    );
    assert!(h.connection.check_blocked_user("alice", &ann).unwrap());
    assert!(h.connection.check_blocked_user("alice", &bob).unwrap());

    h.connection.unblock_users("alice", &[ann.clone()]).unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(
            b,
            RequestBody::BlockUsers {
                user_uris,
                block: false,
                ..
            } if user_uris == "sip:ann@example.com"
        )
    });
    h.respond_ok(request);
    assert!(!h.connection.check_blocked_user("alice", &ann).unwrap());
    assert!(h.connection.check_blocked_user("alice", &bob).unwrap());
}

#[test]
fn block_then_unblock_before_login_settles_sends_nothing() {
    let mut h = Harness::new();
    h.connect();
    h.connection.login("alice", "secret").unwrap();
    let login = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::Login { .. })
    });

    let ann = Uri::new("sip:ann@example.com");
    h.connection.block_users("alice", &[ann.clone()]).unwrap();
    h.connection.unblock_users("alice", &[ann]).unwrap();
    assert!(h.transport.take_requests().is_empty());

    // Login completion reconciles; the cancelled rule never goes out.
    h.respond_ok(login);
    assert!(h
        .transport
        .take_requests()
        .iter()
        .all(|r| !matches!(r.body, RequestBody::BlockUsers { .. })));
}

// ---- devices ----------------------------------------------------------------

#[test]
fn device_selection_requires_an_advertised_device() {
    let mut h = Harness::new();
    let err = h
        .connection
        .set_audio_input_device(&DeviceId::new("mic-usb-0"))
        .unwrap_err();
    assert!(matches!(err, ClientError::NoSuchEntity(_)));

    h.inject(VoiceEvent::AvailableDevicesChanged {
        capture_devices: vec![AudioDevice {
            device_id: DeviceId::new("mic-usb-0"),
            display_name: "USB Microphone".into(),
        }],
        render_devices: Vec::new(),
    });
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::AvailableDevicesChanged
        )),
        1
    );

    h.connection
        .set_audio_input_device(&DeviceId::new("mic-usb-0"))
        .unwrap();
    let request = only_request(h.transport.take_requests(), |b| {
        matches!(b, RequestBody::SetCaptureDevice { .. })
    });
    h.respond_ok(request);
    let events = h.drain_events();
    assert_eq!(
        count_events(&events, |e| matches!(
            e,
            ClientEvent::DeviceSelected {
                direction: AudioDirection::Input,
                policy: DevicePolicy::Specific { .. },
            }
        )),
        1
    );
}

#[test]
fn default_device_policies_need_no_device_list() {
    let mut h = Harness::new();
    h.connection
        .use_default_communication_audio_output_device()
        .unwrap();
    only_request(h.transport.take_requests(), |b| {
        matches!(
            b,
            RequestBody::SetRenderDevice {
                policy: DevicePolicy::DefaultCommunication,
            }
        )
    });
}

// ---- async facade -----------------------------------------------------------

#[tokio::test]
async fn pump_dispatches_transport_messages() {
    let transport = RecordingTransport::new();
    let client = VoiceClient::new(transport.clone(), ClientConfig::default());
    client.start().await;

    VoiceClientHandle::connect(&client, SERVER, PORTS)
        .await
        .unwrap();
    let create = only_request(transport.take_requests(), |b| {
        matches!(b, RequestBody::ConnectorCreate { .. })
    });

    let mut events = client.subscribe_events();
    transport
        .messages
        .send(TransportMessage::Response(VoiceResponse {
            request: create,
            status_code: status::OK,
        }))
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ClientEvent::ConnectCompleted));
    client.stop().await;
}

#[tokio::test]
async fn repeated_shutdown_confirms_without_backend_round_trip() {
    let transport = RecordingTransport::new();
    let client = VoiceClient::new(transport.clone(), ClientConfig::default());
    client.start().await;
    VoiceClientHandle::connect(&client, SERVER, PORTS)
        .await
        .unwrap();
    let create = only_request(transport.take_requests(), |b| {
        matches!(b, RequestBody::ConnectorCreate { .. })
    });
    let mut events = client.subscribe_events();
    transport
        .messages
        .send(TransportMessage::Response(VoiceResponse {
            request: create,
            status_code: status::OK,
        }))
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ClientEvent::ConnectCompleted));

    let responder = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            loop {
                if let Some(request) = transport
                    .take_requests()
                    .into_iter()
                    .find(|r| matches!(r.body, RequestBody::ConnectorShutdown { .. }))
                {
                    transport
                        .messages
                        .send(TransportMessage::Response(VoiceResponse {
                            request,
                            status_code: status::OK,
                        }))
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    client.shutdown(SERVER, Duration::from_secs(2)).await.unwrap();
    responder.await.unwrap();

    // Already down; the second shutdown must confirm without a round trip.
    client.shutdown(SERVER, Duration::from_secs(1)).await.unwrap();
    assert!(transport.take_requests().is_empty());
}

#[tokio::test]
async fn wait_for_event_times_out_cleanly() {
    let transport = RecordingTransport::new();
    let client = VoiceClient::new(transport, ClientConfig::default());
    let result = client
        .wait_for_event(Duration::from_millis(20), |_| true)
        .await;
    assert!(result.is_err());
}
