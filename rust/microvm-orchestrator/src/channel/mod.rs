//! Agent <-> control plane control channel.

pub mod agent;
pub mod codec;
pub mod protocol;
pub mod server;

pub use agent::{AgentChannel, AgentChannelSettings};
pub use codec::ControlCodec;
pub use server::{ControlPlaneServer, ServerSettings};

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OrchestratorResult;
use crate::metrics;
use protocol::{ControlMessage, Envelope, OutboundSequencer, SequenceTracker};

/// Stamp `message` with the next sequence number and write it out.
pub(crate) async fn send_message<T>(
    framed: &mut Framed<T, ControlCodec>,
    out: &mut OutboundSequencer,
    message: ControlMessage,
) -> OrchestratorResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    metrics::record_message("outbound", message.kind());
    framed.send(out.seal(message)).await
}

/// Unwrap an inbound envelope, dropping replays and frames for another channel.
pub(crate) fn accept_inbound(
    envelope: Envelope,
    channel_id: Uuid,
    tracker: &mut SequenceTracker,
) -> Option<ControlMessage> {
    let kind = envelope.message.kind();
    if envelope.channel_id != channel_id {
        warn!(
            expected = %channel_id,
            got = %envelope.channel_id,
            kind,
            "Dropping message for another channel"
        );
        return None;
    }
    if !tracker.accept(envelope.seq) {
        metrics::record_duplicate(kind);
        debug!(
            seq = envelope.seq,
            last_accepted = tracker.last_accepted(),
            kind,
            "Dropping duplicate message"
        );
        return None;
    }
    metrics::record_message("inbound", kind);
    Some(envelope.message)
}
