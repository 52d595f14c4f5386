//! Validated JSON codec with optional zstd compression.

use std::borrow::Cow;

use bytes::Bytes;
use posecast_ipc::{Compression, ControlMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::EncoderError;
use crate::record::{JointRecord, JointSet, TrackedBodyFrame};
use crate::{EncoderResult, COMPRESSION_LEVEL, MAX_DECODED_PAYLOAD};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// The single serializer for every telemetry payload.
///
/// Outbound values are validated before serialization. Inbound payloads are
/// decompressed when they carry the zstd magic number, whatever this codec's
/// own compression setting is.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec {
    compression: Compression,
}

impl WireCodec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Serialize a whole frame for the direct channel.
    pub fn encode_frame(&self, frame: &TrackedBodyFrame) -> EncoderResult<Bytes> {
        frame.validate()?;
        self.encode_value(frame)
    }

    pub fn decode_frame(&self, payload: &[u8]) -> EncoderResult<TrackedBodyFrame> {
        let frame: TrackedBodyFrame = self.decode_value(payload)?;
        frame.validate()?;
        Ok(frame)
    }

    /// Serialize a single record for the group messenger.
    pub fn encode_record(&self, record: &JointRecord) -> EncoderResult<Bytes> {
        record.validate()?;
        self.encode_value(record)
    }

    pub fn decode_record(&self, payload: &[u8]) -> EncoderResult<JointRecord> {
        let record: JointRecord = self.decode_value(payload)?;
        record.validate()?;
        Ok(record)
    }

    /// Serialize one body's records as a journal attachment.
    pub fn encode_joint_set(&self, set: &JointSet) -> EncoderResult<Bytes> {
        set.validate()?;
        self.encode_value(set)
    }

    pub fn decode_joint_set(&self, payload: &[u8]) -> EncoderResult<JointSet> {
        let set: JointSet = self.decode_value(payload)?;
        set.validate()?;
        Ok(set)
    }

    pub fn encode_control(&self, message: &ControlMessage) -> EncoderResult<Bytes> {
        self.encode_value(message)
    }

    pub fn decode_control(&self, payload: &[u8]) -> EncoderResult<ControlMessage> {
        self.decode_value(payload)
    }

    fn encode_value<T: Serialize>(&self, value: &T) -> EncoderResult<Bytes> {
        let json = serde_json::to_vec(value).map_err(EncoderError::Serialize)?;
        if !self.compression.is_enabled() {
            trace!(bytes = json.len(), "Encoded payload");
            return Ok(Bytes::from(json));
        }

        let packed = zstd::bulk::compress(&json, COMPRESSION_LEVEL).map_err(|_| {
            EncoderError::CompressionFailed {
                payload_size: json.len(),
            }
        })?;
        trace!(raw = json.len(), packed = packed.len(), "Encoded compressed payload");
        Ok(Bytes::from(packed))
    }

    fn decode_value<T: DeserializeOwned>(&self, payload: &[u8]) -> EncoderResult<T> {
        let json = Self::unpack(payload)?;
        serde_json::from_slice(&json).map_err(EncoderError::Deserialize)
    }

    /// Return the JSON body of a payload, inflating it if compressed.
    pub fn unpack(payload: &[u8]) -> EncoderResult<Cow<'_, [u8]>> {
        if payload.is_empty() {
            return Err(EncoderError::EmptyPayload);
        }
        if !Self::is_compressed(payload) {
            return Ok(Cow::Borrowed(payload));
        }

        zstd::bulk::decompress(payload, MAX_DECODED_PAYLOAD)
            .map(Cow::Owned)
            .map_err(|_| EncoderError::DecompressionFailed {
                payload_size: payload.len(),
            })
    }

    pub fn is_compressed(payload: &[u8]) -> bool {
        payload.starts_with(&ZSTD_MAGIC)
    }
}
