//! Length-prefixed JSON framing for control channel envelopes.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Envelope;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Largest accepted frame; full snapshots of a busy host stay well below this.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// 4-byte big-endian length prefix followed by one JSON envelope.
#[derive(Debug)]
pub struct ControlCodec {
    frames: LengthDelimitedCodec,
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }
}

impl Decoder for ControlCodec {
    type Item = Envelope;
    type Error = OrchestratorError;

    fn decode(&mut self, src: &mut BytesMut) -> OrchestratorResult<Option<Envelope>> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for ControlCodec {
    type Error = OrchestratorError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> OrchestratorResult<()> {
        let body = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::protocol::{ControlMessage, Heartbeat, OutboundSequencer};
    use uuid::Uuid;

    #[test]
    fn test_frames_split_across_reads() {
        let mut codec = ControlCodec::default();
        let mut out = OutboundSequencer::new(Uuid::new_v4());
        let mut wire = BytesMut::new();
        codec
            .encode(out.seal(ControlMessage::Heartbeat(Heartbeat::now(None))), &mut wire)
            .unwrap();
        codec
            .encode(out.seal(ControlMessage::Heartbeat(Heartbeat::now(None))), &mut wire)
            .unwrap();

        let mut partial = wire.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);

        let first = codec.decode(&mut partial).unwrap().unwrap();
        let second = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = ControlCodec::default();
        let mut wire = BytesMut::new();
        let len = u32::try_from(MAX_FRAME_BYTES + 1).unwrap();
        wire.extend_from_slice(&len.to_be_bytes());
        wire.extend_from_slice(b"{}");
        assert!(codec.decode(&mut wire).is_err());
    }

    #[test]
    fn test_garbage_payload_is_protocol_error() {
        let mut codec = ControlCodec::default();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&5u32.to_be_bytes());
        wire.extend_from_slice(b"nope!");
        assert!(matches!(codec.decode(&mut wire), Err(OrchestratorError::Protocol(_))));
    }
}
