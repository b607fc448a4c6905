//! Framed TCP transport for node links.
//!
//! Each link carries length-delimited JSON frames. After the `Hello`
//! exchange the connection is split into a writer task fed by an unbounded
//! channel and a reader task that forwards decoded frames into the node
//! loop as [`NodeCommand::LinkFrame`].

use crate::errors::RuntimeError;
use crate::id::NodeId;
use crate::messages::NodeCommand;
use crate::proto::Frame;
use crate::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error};

use super::LinkHandle;

fn encode(frame: &Frame) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

/// Dial a peer's runtime address and hand the established link to the node
/// loop. The caller reports failures itself; nothing is registered until
/// the handshake completes.
pub async fn open_outbound(
    addr: &str,
    node_id: NodeId,
    rt_uri: String,
    commands: mpsc::Sender<NodeCommand>,
) -> Result<NodeId> {
    let stream = TcpStream::connect(addr).await?;
    handshake_and_spawn(stream, node_id, rt_uri, commands, true).await
}

/// Run the `Hello` exchange on a fresh connection, then spawn the reader
/// and writer pumps. Returns the peer's node id.
pub async fn handshake_and_spawn(
    stream: TcpStream,
    node_id: NodeId,
    rt_uri: String,
    commands: mpsc::Sender<NodeCommand>,
    initiated: bool,
) -> Result<NodeId> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let hello = Frame::Hello {
        node_id,
        rt_uri: rt_uri.clone(),
    };
    if initiated {
        framed.send(encode(&hello)?).await?;
    }
    let first = framed
        .next()
        .await
        .ok_or_else(|| RuntimeError::Internal("connection closed during handshake".to_string()))??;
    let Frame::Hello {
        node_id: peer,
        rt_uri: peer_uri,
    } = serde_json::from_slice(&first)?
    else {
        return Err(RuntimeError::BadRequest(
            "expected hello frame".to_string(),
        ));
    };
    if !initiated {
        framed.send(encode(&hello)?).await?;
    }
    debug!("handshake complete with {} at {}", peer, peer_uri);

    let (mut sink, mut source) = framed.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let bytes = match encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("failed to encode frame for {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(bytes).await {
                debug!("write to {} failed: {}", peer, e);
                break;
            }
        }
    });

    let reader_commands = commands.clone();
    tokio::spawn(async move {
        loop {
            match source.next().await {
                Some(Ok(bytes)) => match serde_json::from_slice::<Frame>(&bytes) {
                    Ok(frame) => {
                        if reader_commands
                            .send(NodeCommand::LinkFrame { peer, frame })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        error!("undecodable frame from {}: {}", peer, e);
                        break;
                    }
                },
                Some(Err(e)) => {
                    debug!("read from {} failed: {}", peer, e);
                    break;
                }
                None => {
                    debug!("link to {} closed", peer);
                    break;
                }
            }
        }
        let _ = reader_commands.send(NodeCommand::LinkDown { peer }).await;
    });

    let link = LinkHandle {
        peer,
        rt_uri: peer_uri,
        tx,
    };
    commands
        .send(NodeCommand::LinkEstablished { link, initiated })
        .await
        .map_err(|_| RuntimeError::ChannelClosed("node command channel".to_string()))?;
    Ok(peer)
}
