// ingest-core/src/wire.rs
// Length-prefixed protobuf framing for the agent-facing RPC endpoint.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{IngestError, Result};

/// Upper bound on a single frame; a LogEvent should never come close.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Wrap a transport in the framed codec used on both sides of the wire.
pub fn framed<S>(io: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(io, codec)
}

/// Send one protobuf message as a frame.
pub async fn send_frame<S, M>(framed: &mut Framed<S, LengthDelimitedCodec>, msg: &M) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: Message,
{
    framed
        .send(Bytes::from(msg.encode_to_vec()))
        .await
        .map_err(|e| IngestError::transport("send frame", e))
}

/// Receive one frame and decode it. `Ok(None)` signals a clean EOF.
pub async fn recv_frame<S, M>(framed: &mut Framed<S, LengthDelimitedCodec>) -> Result<Option<M>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: Message + Default,
{
    match framed.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(IngestError::transport("recv frame", e)),
        Some(Ok(buf)) => Ok(Some(M::decode(buf.freeze())?)),
    }
}
