use serde::{Deserialize, Serialize};

use crate::domain::{
    AudioDevice, Cookie, DevicePolicy, Handle, LoginState, UdpPortRange, Uri,
};

/// One fire-and-forget request toward the voice backend. The cookie is the
/// opaque correlation string the matching response echoes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceRequest {
    pub cookie: Cookie,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RequestBody {
    ConnectorCreate {
        connector_handle: Handle,
        server_uri: Uri,
        udp_port_range: UdpPortRange,
    },
    ConnectorShutdown {
        connector_handle: Handle,
    },
    Login {
        connector_handle: Handle,
        account_handle: Handle,
        account_name: String,
        credentials: String,
    },
    Logout {
        account_handle: Handle,
    },
    /// Bulk block-rule change; URIs are joined with a line-feed separator,
    /// one request per direction per reconciliation pass.
    BlockUsers {
        account_handle: Handle,
        user_uris: String,
        block: bool,
    },
    AddSession {
        session_group_handle: Handle,
        session_handle: Handle,
        channel_uri: Uri,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        connect_audio: bool,
        connect_text: bool,
    },
    RemoveSession {
        session_group_handle: Handle,
        session_handle: Handle,
    },
    SetLocalRenderVolume {
        session_handle: Handle,
        volume: u32,
    },
    SetParticipantVolumeForMe {
        session_handle: Handle,
        participant_uri: Uri,
        volume: u32,
    },
    SetParticipantMuteForMe {
        session_handle: Handle,
        participant_uri: Uri,
        mute: bool,
    },
    SetParticipantMuteForAll {
        session_handle: Handle,
        participant_uri: Uri,
        mute: bool,
    },
    /// The requested channel URI rides along as correlation data; the
    /// session handle alone can go stale between request and response.
    SetTxSession {
        session_group_handle: Handle,
        session_handle: Handle,
        channel_uri: Uri,
    },
    SetTxAllSessions {
        session_group_handle: Handle,
    },
    SetTxNoSession {
        session_group_handle: Handle,
    },
    /// The requested policy rides along as correlation data so the response
    /// handler can apply it without re-deriving intent.
    SetCaptureDevice {
        policy: DevicePolicy,
    },
    SetRenderDevice {
        policy: DevicePolicy,
    },
    SetMicLevel {
        level: u32,
    },
    SetSpeakerLevel {
        level: u32,
    },
}

/// A response correlates to its originating request by echoing it whole; a
/// zero status code means the backend accepted the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceResponse {
    pub request: VoiceRequest,
    pub status_code: i32,
}

impl VoiceResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == crate::error::status::OK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStreamState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioStage {
    CaptureRead,
    BeforeSend,
    BeforeRender,
}

/// Server-pushed events, unsolicited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum VoiceEvent {
    AccountLoginStateChange {
        account_handle: Handle,
        state: LoginState,
        status_code: i32,
    },
    ParticipantAdded {
        session_handle: Handle,
        participant_uri: Uri,
        account_name: String,
        display_name: String,
        is_current_user: bool,
    },
    ParticipantUpdated {
        session_handle: Handle,
        participant_uri: Uri,
        is_muted_for_all: bool,
        is_speaking: bool,
        energy: f32,
    },
    ParticipantRemoved {
        session_handle: Handle,
        participant_uri: Uri,
    },
    MediaStreamUpdated {
        session_group_handle: Handle,
        session_handle: Handle,
        state: MediaStreamState,
        status_code: i32,
    },
    AvailableDevicesChanged {
        capture_devices: Vec<AudioDevice>,
        render_devices: Vec<AudioDevice>,
    },
    /// Raw audio passthrough for optional low-level processing; the frame
    /// payload is opaque to this layer.
    AudioFrame {
        stage: AudioStage,
        frame: Vec<i16>,
        sample_rate: u32,
        channels: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportMessage {
    Response(VoiceResponse),
    Event(VoiceEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceId;

    #[test]
    fn request_round_trips_through_json() {
        let request = VoiceRequest {
            cookie: Cookie::new("req-7"),
            body: RequestBody::AddSession {
                session_group_handle: Handle::new("sg-1"),
                session_handle: Handle::new("sess-3"),
                channel_uri: Uri::new("sip:confctl-2@example.com"),
                access_token: Some("token".into()),
                connect_audio: true,
                connect_text: false,
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: VoiceRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn device_policy_correlation_survives_response_echo() {
        let request = VoiceRequest {
            cookie: Cookie::new("req-9"),
            body: RequestBody::SetCaptureDevice {
                policy: DevicePolicy::Specific {
                    device_id: DeviceId::new("mic-usb-0"),
                },
            },
        };
        let response = VoiceResponse {
            request: request.clone(),
            status_code: 0,
        };
        let json = serde_json::to_string(&TransportMessage::Response(response)).unwrap();
        let back: TransportMessage = serde_json::from_str(&json).unwrap();
        match back {
            TransportMessage::Response(response) => {
                assert!(response.is_success());
                assert_eq!(response.request, request);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
