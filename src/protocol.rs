//! Wire protocol between the daemon and the remote control plane.
//!
//! Every frame on the cloud WebSocket is a JSON envelope: a `type` tag, an
//! optional millisecond timestamp, and an opaque `data` payload decoded only
//! once the type is known. Binary payloads (video frames, audio) travel as
//! standard base64 inside `data`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    // Daemon → remote
    Frame,
    Doa,
    Mic,
    State,

    // Remote → daemon
    Motor,
    Speak,
    Emotion,
    Config,

    // Bidirectional
    Ping,
    Pong,
}

/// The envelope wrapping every WebSocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Milliseconds since the Unix epoch, stamped at construction.
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Message {
    /// Build a message with the current timestamp and a serialized payload.
    pub fn new<T: Serialize>(kind: MessageType, data: T) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            timestamp: Some(Utc::now().timestamp_millis()),
            data: Some(serde_json::to_value(data)?),
        })
    }

    /// Build a payload-free message (`ping`, `pong`).
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            timestamp: Some(Utc::now().timestamp_millis()),
            data: None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an incoming frame. Malformed input is a protocol error; the
    /// caller discards the message.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode the payload into a concrete type. A missing payload decodes
    /// into the type's default.
    pub fn parse_data<T: DeserializeOwned + Default>(&self) -> Result<T, ProtocolError> {
        match &self.data {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(T::default()),
        }
    }

    pub fn motor_command(&self) -> Result<MotorCommand, ProtocolError> {
        self.parse_data()
    }

    pub fn emotion_command(&self) -> Result<EmotionCommand, ProtocolError> {
        self.parse_data()
    }

    pub fn speak_data(&self) -> Result<SpeakData, ProtocolError> {
        self.parse_data()
    }

    pub fn config_update(&self) -> Result<ConfigUpdate, ProtocolError> {
        self.parse_data()
    }
}

/// One encoded video frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameData {
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Base64 of the encoded image bytes.
    pub data: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub frame_id: u64,
}

/// Direction-of-arrival snapshot sent upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoaData {
    pub angle: f64,
    pub smoothed_angle: f64,
    pub speaking: bool,
    pub speaking_latched: bool,
    pub confidence: f64,
}

/// One chunk of captured microphone audio.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicData {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Base64 of the PCM bytes.
    pub data: String,
}

/// Motor movement instruction from the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorCommand {
    pub head: HeadTarget,
    pub antennas: [f64; 2],
    pub body_yaw: f64,
}

/// Target head pose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadTarget {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Emotion animation trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmotionCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// TTS audio to play back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakData {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Base64 of the audio bytes.
    pub data: String,
}

impl SpeakData {
    pub fn decode_audio(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(BASE64.decode(&self.data)?)
    }
}

/// Runtime configuration pushed from the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

/// Build a `frame` message from raw encoded image bytes.
pub fn new_frame_message(
    width: u32,
    height: u32,
    jpeg: &[u8],
    frame_id: u64,
) -> Result<Message, ProtocolError> {
    Message::new(
        MessageType::Frame,
        FrameData {
            width,
            height,
            format: "jpeg".to_string(),
            data: BASE64.encode(jpeg),
            frame_id,
        },
    )
}

/// Build a `doa` message.
pub fn new_doa_message(
    angle: f64,
    smoothed_angle: f64,
    speaking: bool,
    speaking_latched: bool,
    confidence: f64,
) -> Result<Message, ProtocolError> {
    Message::new(
        MessageType::Doa,
        DoaData {
            angle,
            smoothed_angle,
            speaking,
            speaking_latched,
            confidence,
        },
    )
}

/// Build a `mic` message from raw PCM bytes.
pub fn new_mic_message(
    sample_rate: u32,
    channels: u8,
    pcm: &[u8],
) -> Result<Message, ProtocolError> {
    Message::new(
        MessageType::Mic,
        MicData {
            format: "pcm16".to_string(),
            sample_rate,
            channels,
            data: BASE64.encode(pcm),
        },
    )
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_stamps_timestamp() {
        let msg = Message::new(MessageType::Frame, FrameData::default()).unwrap();
        assert_eq!(msg.kind, MessageType::Frame);
        assert!(msg.timestamp.unwrap() > 0);
    }

    #[test]
    fn test_type_tags_serialize_lowercase() {
        let msg = Message::empty(MessageType::Ping);
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"ping""#));

        let msg = Message::new(MessageType::Motor, MotorCommand::default()).unwrap();
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"motor""#));
    }

    #[test]
    fn test_motor_round_trip() {
        let original = MotorCommand {
            head: HeadTarget {
                x: 0.1,
                y: 0.2,
                z: 0.3,
                yaw: 0.5,
                ..Default::default()
            },
            antennas: [0.3, 0.7],
            body_yaw: 0.1,
        };

        let msg = Message::new(MessageType::Motor, original.clone()).unwrap();
        let bytes = msg.to_json().unwrap().into_bytes();
        let parsed = Message::parse(&bytes).unwrap();

        assert_eq!(parsed.kind, MessageType::Motor);
        assert!(parsed.timestamp.unwrap() > 0);
        assert_eq!(parsed.motor_command().unwrap(), original);
    }

    #[test]
    fn test_all_payload_types_round_trip() {
        let speak = SpeakData {
            format: "pcm16".into(),
            sample_rate: 16000,
            channels: 1,
            data: BASE64.encode(b"audio"),
        };
        let msg = Message::new(MessageType::Speak, speak.clone()).unwrap();
        let parsed = Message::parse(msg.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed.speak_data().unwrap(), speak);

        let emotion = EmotionCommand {
            name: "happy".into(),
            duration: Some(2.5),
        };
        let msg = Message::new(MessageType::Emotion, emotion.clone()).unwrap();
        let parsed = Message::parse(msg.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed.emotion_command().unwrap(), emotion);

        let config = ConfigUpdate {
            camera: Some(CameraSettings {
                width: Some(640),
                framerate: Some(15),
                ..Default::default()
            }),
        };
        let msg = Message::new(MessageType::Config, config.clone()).unwrap();
        let parsed = Message::parse(msg.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed.config_update().unwrap(), config);

        let doa = DoaData {
            angle: 0.5,
            smoothed_angle: 0.48,
            speaking: true,
            speaking_latched: true,
            confidence: 0.9,
        };
        let msg = Message::new(MessageType::Doa, doa.clone()).unwrap();
        let parsed = Message::parse(msg.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(parsed.parse_data::<DoaData>().unwrap(), doa);
    }

    #[test]
    fn test_frame_message_base64_round_trip() {
        let jpeg = [0xFFu8, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        let msg = new_frame_message(640, 480, &jpeg, 7).unwrap();

        let parsed = Message::parse(msg.to_json().unwrap().as_bytes()).unwrap();
        let frame: FrameData = parsed.parse_data().unwrap();

        assert_eq!(frame.width, 640);
        assert_eq!(frame.height, 480);
        assert_eq!(frame.format, "jpeg");
        assert_eq!(frame.frame_id, 7);
        assert_eq!(BASE64.decode(&frame.data).unwrap(), jpeg);
    }

    #[test]
    fn test_mic_message_base64_round_trip() {
        let pcm = [0x01u8, 0x02, 0x03, 0x04];
        let msg = new_mic_message(16000, 1, &pcm).unwrap();

        let parsed = Message::parse(msg.to_json().unwrap().as_bytes()).unwrap();
        let mic: MicData = parsed.parse_data().unwrap();
        assert_eq!(mic.sample_rate, 16000);
        assert_eq!(BASE64.decode(&mic.data).unwrap(), pcm);
    }

    #[test]
    fn test_speak_decode_audio() {
        let speak = SpeakData {
            format: "pcm16".into(),
            sample_rate: 22050,
            channels: 1,
            data: BASE64.encode(b"hello"),
        };
        assert_eq!(speak.decode_audio().unwrap(), b"hello");

        let bad = SpeakData {
            data: "not base64!!".into(),
            ..Default::default()
        };
        assert!(bad.decode_audio().is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(Message::parse(b"not json").is_err());
        assert!(Message::parse(br#"{"type":"no-such-type"}"#).is_err());
        assert!(Message::parse(b"").is_err());
    }

    #[test]
    fn test_empty_message_omits_fields() {
        let mut msg = Message::empty(MessageType::Pong);
        msg.timestamp = None;
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_ping_pong_round_trip() {
        for kind in [MessageType::Ping, MessageType::Pong] {
            let msg = Message::empty(kind);
            let parsed = Message::parse(msg.to_json().unwrap().as_bytes()).unwrap();
            assert_eq!(parsed.kind, kind);
            assert!(parsed.data.is_none());
        }
    }
}
