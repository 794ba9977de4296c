use shared::{
    domain::{DevicePolicy, TransmissionPolicy, Uri},
    protocol::AudioStage,
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    Input,
    Output,
}

/// One variant per user-visible outcome, delivered on a broadcast channel.
///
/// Synchronous contract errors are returned from the public calls directly;
/// everything that resolves after the original call returned arrives here.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectCompleted,
    ConnectFailed {
        status_code: i32,
    },
    DisconnectCompleted,
    LoginCompleted {
        account: String,
    },
    LoginFailed {
        account: String,
        status_code: i32,
    },
    LogoutCompleted {
        account: String,
    },
    ChannelJoined {
        account: String,
        channel_uri: Uri,
    },
    ChannelJoinFailed {
        account: String,
        channel_uri: Uri,
        status_code: i32,
    },
    ChannelExited {
        account: String,
        channel_uri: Uri,
        status_code: i32,
    },
    ParticipantAdded {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        display_name: String,
    },
    ParticipantUpdated {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        is_muted_for_all: bool,
        is_speaking: bool,
        energy: f32,
    },
    ParticipantLeft {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
    },
    ChannelVolumeCompleted {
        account: String,
        channel_uri: Uri,
        volume: u32,
    },
    ChannelVolumeFailed {
        account: String,
        channel_uri: Uri,
        volume: u32,
        status_code: i32,
    },
    ParticipantVolumeCompleted {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        volume: u32,
    },
    ParticipantVolumeFailed {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        volume: u32,
        status_code: i32,
    },
    ParticipantMuteForMeCompleted {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        muted: bool,
    },
    ParticipantMuteForMeFailed {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        muted: bool,
        status_code: i32,
    },
    ParticipantMuteForAllCompleted {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        muted: bool,
    },
    ParticipantMuteForAllFailed {
        account: String,
        channel_uri: Uri,
        participant_uri: Uri,
        muted: bool,
        status_code: i32,
    },
    TransmissionChanged {
        account: String,
        policy: TransmissionPolicy,
    },
    TransmissionFailed {
        account: String,
        policy: TransmissionPolicy,
        status_code: i32,
    },
    MasterVolumeCompleted {
        direction: AudioDirection,
        level: u32,
    },
    MasterVolumeFailed {
        direction: AudioDirection,
        level: u32,
        status_code: i32,
    },
    DeviceSelected {
        direction: AudioDirection,
        policy: DevicePolicy,
    },
    DeviceFailed {
        direction: AudioDirection,
        policy: DevicePolicy,
        status_code: i32,
    },
    AvailableDevicesChanged,
    BlockRuleApplied {
        account: String,
        user_uris: Vec<Uri>,
        blocked: bool,
    },
    BlockRuleFailed {
        account: String,
        status_code: i32,
    },
    /// Raw audio passthrough, unmodified.
    AudioFrame {
        stage: AudioStage,
        frame: Vec<i16>,
        sample_rate: u32,
        channels: u16,
    },
}

/// Thin wrapper over the broadcast sender; delivery to zero subscribers is
/// not an error.
#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }
}
