//! Call control messages and their binary wire format
//!
//! A serialized message is:
//! - seq: 4 bytes (big-endian)
//! - tag: 1 byte
//! - body: tag-dependent
//!
//! All integers are big-endian. Strings are a u32 length followed by that
//! many bytes of UTF-8; lengths of 65536 or more are rejected. Count-prefixed
//! sequences use a single u8 count.
//!
//! Raw data bodies (audio, video, unstructured) come in two framings: inside
//! a single-message packet the payload simply runs to the end of the buffer;
//! otherwise it carries a u16 length prefix. The framing layer decides which
//! applies and threads it through as `single_message_packet`.

use std::collections::HashMap;

use crate::protocol::candidate::IceCandidate;

/// Strings on the wire must be strictly shorter than this
pub const MAX_STRING_LENGTH: usize = 65536;

/// Message type tags
const TAG_CANDIDATES_LIST: u8 = 0x01;
const TAG_VIDEO_FORMATS: u8 = 0x02;
const TAG_REQUEST_VIDEO: u8 = 0x03;
const TAG_REMOTE_VIDEO_IS_ACTIVE: u8 = 0x04;
const TAG_AUDIO_DATA: u8 = 0x05;
const TAG_VIDEO_DATA: u8 = 0x06;
const TAG_UNSTRUCTURED_DATA: u8 = 0x07;

/// A video codec offered or accepted by one side
///
/// Parameter order is not preserved across the wire; keys are unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub name: String,
    pub parameters: HashMap<String, String>,
}

impl VideoFormat {
    /// Create a format with no parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: HashMap::new(),
        }
    }
}

/// A control or media message exchanged between the two endpoints
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// ICE candidates gathered by the sender
    CandidatesList { candidates: Vec<IceCandidate> },
    /// The sender's supported video codecs; the first `encoders_count`
    /// entries are encodable locally, the rest are decode-only
    VideoFormats {
        formats: Vec<VideoFormat>,
        encoders_count: u8,
    },
    /// The sender wants to receive video
    RequestVideo,
    /// Whether the sender's outgoing video is currently flowing
    RemoteVideoIsActive { active: bool },
    /// One encrypted RTP/RTCP audio packet
    AudioData { data: Vec<u8> },
    /// One encrypted RTP/RTCP video packet
    VideoData { data: Vec<u8> },
    /// Opaque embedder payload
    UnstructuredData { data: Vec<u8> },
}

impl Message {
    /// Wire tag for this variant
    pub fn tag(&self) -> u8 {
        match self {
            Message::CandidatesList { .. } => TAG_CANDIDATES_LIST,
            Message::VideoFormats { .. } => TAG_VIDEO_FORMATS,
            Message::RequestVideo => TAG_REQUEST_VIDEO,
            Message::RemoteVideoIsActive { .. } => TAG_REMOTE_VIDEO_IS_ACTIVE,
            Message::AudioData { .. } => TAG_AUDIO_DATA,
            Message::VideoData { .. } => TAG_VIDEO_DATA,
            Message::UnstructuredData { .. } => TAG_UNSTRUCTURED_DATA,
        }
    }
}

/// Sequential big-endian reader over a received buffer
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a u32-length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Option<String> {
        let length = self.read_u32()? as usize;
        if length >= MAX_STRING_LENGTH {
            return None;
        }
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    /// Consume and return everything left in the buffer
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    assert!(value.len() < MAX_STRING_LENGTH, "string exceeds wire limit");
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn write_format(buf: &mut Vec<u8>, format: &VideoFormat) {
    assert!(format.parameters.len() <= u8::MAX as usize);
    write_string(buf, &format.name);
    buf.push(format.parameters.len() as u8);
    for (key, value) in &format.parameters {
        write_string(buf, key);
        write_string(buf, value);
    }
}

fn read_format(reader: &mut Reader<'_>) -> Option<VideoFormat> {
    let name = reader.read_string()?;
    let count = reader.read_u8()?;
    let mut parameters = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = reader.read_string()?;
        let value = reader.read_string()?;
        parameters.insert(key, value);
    }
    Some(VideoFormat { name, parameters })
}

fn write_data(buf: &mut Vec<u8>, data: &[u8], single_message_packet: bool) {
    if !single_message_packet {
        assert!(data.len() <= u16::MAX as usize, "payload exceeds wire limit");
        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    }
    buf.extend_from_slice(data);
}

fn read_data(reader: &mut Reader<'_>, single_message_packet: bool) -> Option<Vec<u8>> {
    if single_message_packet {
        return Some(reader.rest().to_vec());
    }
    let length = reader.read_u16()? as usize;
    reader.take(length).map(|bytes| bytes.to_vec())
}

/// Serialize a message with its sequence counter
pub fn serialize_message(message: &Message, seq: u32, single_message_packet: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.push(message.tag());

    match message {
        Message::CandidatesList { candidates } => {
            assert!(candidates.len() <= u8::MAX as usize);
            buf.push(candidates.len() as u8);
            for candidate in candidates {
                write_string(&mut buf, &candidate.to_sdp());
            }
        }
        Message::VideoFormats {
            formats,
            encoders_count,
        } => {
            assert!(formats.len() <= u8::MAX as usize);
            assert!((*encoders_count as usize) <= formats.len());
            buf.push(formats.len() as u8);
            for format in formats {
                write_format(&mut buf, format);
            }
            buf.push(*encoders_count);
        }
        Message::RequestVideo => {}
        Message::RemoteVideoIsActive { active } => {
            buf.push(u8::from(*active));
        }
        Message::AudioData { data }
        | Message::VideoData { data }
        | Message::UnstructuredData { data } => {
            write_data(&mut buf, data, single_message_packet);
        }
    }

    buf
}

/// Deserialize one message, returning its sequence counter alongside it
///
/// An unknown tag leaves the reader positioned at the tag byte and returns
/// `None`; the framing layer drops the whole packet.
pub fn deserialize_message(
    reader: &mut Reader<'_>,
    single_message_packet: bool,
) -> Option<(u32, Message)> {
    let seq = reader.read_u32()?;

    // Peek first so an unknown tag is not consumed
    let tag = reader.peek_u8()?;
    if !(TAG_CANDIDATES_LIST..=TAG_UNSTRUCTURED_DATA).contains(&tag) {
        return None;
    }
    reader.read_u8()?;

    let message = match tag {
        TAG_CANDIDATES_LIST => {
            let count = reader.read_u8()?;
            let mut candidates = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let line = reader.read_string()?;
                candidates.push(IceCandidate::from_sdp(&line)?);
            }
            Message::CandidatesList { candidates }
        }
        TAG_VIDEO_FORMATS => {
            let count = reader.read_u8()?;
            let mut formats = Vec::with_capacity(count as usize);
            for _ in 0..count {
                formats.push(read_format(reader)?);
            }
            let encoders_count = reader.read_u8()?;
            if encoders_count as usize > formats.len() {
                return None;
            }
            Message::VideoFormats {
                formats,
                encoders_count,
            }
        }
        TAG_REQUEST_VIDEO => Message::RequestVideo,
        TAG_REMOTE_VIDEO_IS_ACTIVE => {
            let value = reader.read_u8()?;
            Message::RemoteVideoIsActive { active: value != 0 }
        }
        TAG_AUDIO_DATA => Message::AudioData {
            data: read_data(reader, single_message_packet)?,
        },
        TAG_VIDEO_DATA => Message::VideoData {
            data: read_data(reader, single_message_packet)?,
        },
        _ => Message::UnstructuredData {
            data: read_data(reader, single_message_packet)?,
        },
    };

    Some((seq, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn roundtrip(message: Message, single_message_packet: bool) {
        let bytes = serialize_message(&message, 7, single_message_packet);
        let mut reader = Reader::new(&bytes);
        let (seq, decoded) =
            deserialize_message(&mut reader, single_message_packet).expect("Failed to decode");
        assert_eq!(seq, 7);
        assert_eq!(decoded, message);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_request_video_roundtrip() {
        roundtrip(Message::RequestVideo, false);
    }

    #[test]
    fn test_remote_video_is_active_roundtrip() {
        roundtrip(Message::RemoteVideoIsActive { active: true }, false);
        roundtrip(Message::RemoteVideoIsActive { active: false }, false);
    }

    #[test]
    fn test_candidates_list_roundtrip() {
        let addr: SocketAddr = "192.168.1.20:40000".parse().unwrap();
        roundtrip(
            Message::CandidatesList {
                candidates: vec![IceCandidate::host(addr)],
            },
            false,
        );
    }

    #[test]
    fn test_video_formats_roundtrip() {
        let mut h264 = VideoFormat::new("H264");
        h264.parameters
            .insert("profile-level-id".to_string(), "42e01f".to_string());
        h264.parameters
            .insert("packetization-mode".to_string(), "1".to_string());
        roundtrip(
            Message::VideoFormats {
                formats: vec![h264, VideoFormat::new("VP8")],
                encoders_count: 1,
            },
            false,
        );
    }

    #[test]
    fn test_audio_data_single_message_consumes_tail() {
        let bytes = serialize_message(
            &Message::AudioData {
                data: vec![1, 2, 3, 4, 5],
            },
            42,
            true,
        );
        // seq + tag + raw payload, no length prefix
        assert_eq!(bytes.len(), 4 + 1 + 5);

        let mut reader = Reader::new(&bytes);
        let (seq, decoded) = deserialize_message(&mut reader, true).unwrap();
        assert_eq!(seq, 42);
        assert_eq!(
            decoded,
            Message::AudioData {
                data: vec![1, 2, 3, 4, 5]
            }
        );
    }

    #[test]
    fn test_audio_data_multi_message_is_length_prefixed() {
        let bytes = serialize_message(&Message::AudioData { data: vec![9; 8] }, 1, false);
        assert_eq!(bytes.len(), 4 + 1 + 2 + 8);
        roundtrip(Message::AudioData { data: vec![9; 8] }, false);
    }

    #[test]
    fn test_unstructured_data_roundtrip() {
        roundtrip(
            Message::UnstructuredData {
                data: b"opaque".to_vec(),
            },
            true,
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = serialize_message(&Message::RequestVideo, 1, false);
        bytes[4] = 0xEE;
        let mut reader = Reader::new(&bytes);
        assert!(deserialize_message(&mut reader, false).is_none());
        // The tag byte itself is not consumed
        assert_eq!(reader.peek_u8(), Some(0xEE));
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let bytes = serialize_message(
            &Message::VideoFormats {
                formats: vec![VideoFormat::new("VP8")],
                encoders_count: 1,
            },
            1,
            false,
        );
        let mut reader = Reader::new(&bytes[..bytes.len() - 2]);
        assert!(deserialize_message(&mut reader, false).is_none());
    }

    #[test]
    fn test_encoders_count_above_formats_rejected() {
        let mut bytes = serialize_message(
            &Message::VideoFormats {
                formats: vec![VideoFormat::new("VP8"), VideoFormat::new("H264")],
                encoders_count: 2,
            },
            1,
            false,
        );
        // Last byte is encoders_count
        *bytes.last_mut().unwrap() = 3;
        let mut reader = Reader::new(&bytes);
        assert!(deserialize_message(&mut reader, false).is_none());
    }

    #[test]
    fn test_oversized_string_rejected() {
        let mut bytes = vec![0, 0, 0, 1, TAG_CANDIDATES_LIST, 1];
        bytes.extend_from_slice(&(MAX_STRING_LENGTH as u32).to_be_bytes());
        bytes.extend_from_slice(&[b'a'; 16]);
        let mut reader = Reader::new(&bytes);
        assert!(deserialize_message(&mut reader, false).is_none());
    }

    #[test]
    fn test_reader_primitives() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_u16(), Some(0x0102));
        assert_eq!(reader.read_u8(), Some(0x03));
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.rest(), &[0x04, 0x05]);
        assert!(reader.is_empty());
        assert_eq!(reader.read_u8(), None);
    }
}
