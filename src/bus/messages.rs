//! Messages carried by the control bus.
//!
//! Everything here is serde-serializable so a host can carry requests,
//! responses and topic traffic as JSON.

use crate::types::{DataChannelSpec, MediaConstraints, ServiceNames};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Data kind tag of image topics. Only topics with this kind are capture sources.
pub const IMAGE_DATA_KIND: &str = "image/raw";
/// Data kind tag of data-channel traffic topics.
pub const DATA_KIND: &str = "crabrtc/data";
/// Data kind tag of republished audio.
pub const AUDIO_DATA_KIND: &str = "audio/pcm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub peer_id: String,
    #[serde(default)]
    pub sdp_constraints: MediaConstraints,
    #[serde(default)]
    pub data_channels: Vec<DataChannelSpec>,
    #[serde(default)]
    pub disconnect_service: String,
    #[serde(default)]
    pub ice_candidate_service: String,
    #[serde(default)]
    pub sdp_offer_answer_service: String,
}

impl ConnectRequest {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            sdp_constraints: MediaConstraints::default(),
            data_channels: Vec::new(),
            disconnect_service: String::new(),
            ice_candidate_service: String::new(),
            sdp_offer_answer_service: String::new(),
        }
    }

    pub fn with_data_channel(mut self, spec: DataChannelSpec) -> Self {
        self.data_channels.push(spec);
        self
    }

    pub fn with_callbacks(
        mut self,
        disconnect: impl Into<String>,
        ice_candidate: impl Into<String>,
        sdp_offer_answer: impl Into<String>,
    ) -> Self {
        self.disconnect_service = disconnect.into();
        self.ice_candidate_service = ice_candidate.into();
        self.sdp_offer_answer_service = sdp_offer_answer.into();
        self
    }

    pub fn service_names(&self) -> ServiceNames {
        ServiceNames {
            disconnect: self.disconnect_service.clone(),
            ice_candidate: self.ice_candidate_service.clone(),
            sdp_offer_answer: self.sdp_offer_answer_service.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Connect(ConnectRequest),
    Disconnect {
        peer_id: String,
    },
    IceCandidate {
        peer_id: String,
        sdp_mid: String,
        sdp_mline_index: u16,
        candidate: String,
    },
    SdpOfferAnswer {
        peer_id: String,
        #[serde(rename = "type")]
        sdp_type: String,
        sdp: String,
    },
    Sessions,
}

impl ControlRequest {
    /// Name of the endpoint (without namespace) this request is served by.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ControlRequest::Connect(_) => "connect",
            ControlRequest::Disconnect { .. } => "disconnect",
            ControlRequest::IceCandidate { .. } => "ice_candidate",
            ControlRequest::SdpOfferAnswer { .. } => "sdp_offer_answer",
            ControlRequest::Sessions => "sessions",
        }
    }

    pub fn peer_id(&self) -> Option<&str> {
        match self {
            ControlRequest::Connect(req) => Some(&req.peer_id),
            ControlRequest::Disconnect { peer_id }
            | ControlRequest::IceCandidate { peer_id, .. }
            | ControlRequest::SdpOfferAnswer { peer_id, .. } => Some(peer_id),
            ControlRequest::Sessions => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    Failed { reason: String },
    Sessions { peer_ids: Vec<String> },
}

impl ControlResponse {
    pub fn failed(reason: impl ToString) -> Self {
        ControlResponse::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ControlResponse::Failed { .. })
    }
}

/// A data-channel payload, inbound (`data_send`) or outbound (`data_recv`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub label: String,
    pub buffer: Bytes,
    /// `"binary"` for binary payloads; anything else is text.
    pub encoding: String,
}

impl DataMessage {
    pub fn binary(label: impl Into<String>, buffer: impl Into<Bytes>) -> Self {
        Self {
            label: label.into(),
            buffer: buffer.into(),
            encoding: "binary".to_string(),
        }
    }

    pub fn text(label: impl Into<String>, text: &str) -> Self {
        Self {
            label: label.into(),
            buffer: Bytes::copy_from_slice(text.as_bytes()),
            encoding: "utf-8".to_string(),
        }
    }

    pub fn is_binary(&self) -> bool {
        self.encoding == "binary"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Mono8,
    I420,
}

impl ImageEncoding {
    /// Bytes per pixel of packed encodings; `None` for planar I420.
    pub fn bytes_per_pixel(&self) -> Option<u32> {
        match self {
            ImageEncoding::Rgb8 | ImageEncoding::Bgr8 => Some(3),
            ImageEncoding::Rgba8 | ImageEncoding::Bgra8 => Some(4),
            ImageEncoding::Mono8 => Some(1),
            ImageEncoding::I420 => None,
        }
    }
}

/// One image as published on an image topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMessage {
    /// Source timestamp in nanoseconds.
    pub stamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    /// Row length in bytes for packed encodings.
    pub step: u32,
    pub data: Bytes,
}

impl ImageMessage {
    /// A tightly packed image (`step == width * bytes_per_pixel`).
    pub fn packed(
        width: u32,
        height: u32,
        encoding: ImageEncoding,
        data: impl Into<Bytes>,
        stamp_ns: u64,
    ) -> Self {
        let step = encoding.bytes_per_pixel().map(|bpp| width * bpp).unwrap_or(width);
        Self {
            stamp_ns,
            width,
            height,
            encoding,
            step,
            data: data.into(),
        }
    }
}

/// A chunk of decoded audio republished from the local pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMessage {
    pub track_id: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp_ns: u64,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum BusMessage {
    Data(DataMessage),
    Image(ImageMessage),
    Audio(AudioMessage),
}

impl BusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::Data(_) => DATA_KIND,
            BusMessage::Image(_) => IMAGE_DATA_KIND,
            BusMessage::Audio(_) => AUDIO_DATA_KIND,
        }
    }
}
