use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use rill_server::{ControlCommand, ControlResponse};

/// A framed TCP connection to a Rill control server.
///
/// The connection is lazy: `send` dials on first use, and any read or
/// write error drops the underlying stream so the next call reconnects.
pub struct RillConnection {
    address: SocketAddr,
    connection: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl RillConnection {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            connection: None,
        }
    }

    /// Establish the TCP connection if not already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connection.is_none() {
            debug!("Connecting to control server at {}", self.address);
            let stream = TcpStream::connect(self.address).await?;
            let mut codec = LengthDelimitedCodec::new();
            // Large deploy requests and actor reports can exceed the
            // default frame limit.
            codec.set_max_frame_length(32 * 1024 * 1024);
            self.connection = Some(Framed::new(stream, codec));
        }
        Ok(())
    }

    /// Send a command to the server, connecting first if necessary.
    pub async fn send(&mut self, command: ControlCommand) -> Result<()> {
        self.connect().await?;

        let data = serde_json::to_vec(&command)?;
        if let Some(connection) = &mut self.connection {
            if let Err(e) = connection.send(Bytes::from(data)).await {
                self.connection = None;
                return Err(anyhow::anyhow!("Failed to send command: {}", e));
            }
        }
        Ok(())
    }

    /// Receive the next response from the server.
    pub async fn receive(&mut self) -> Result<ControlResponse> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Not connected"))?;

        match connection.next().await {
            Some(Ok(bytes)) => {
                let response: ControlResponse = serde_json::from_slice(&bytes)?;
                Ok(response)
            }
            Some(Err(e)) => {
                self.connection = None;
                Err(anyhow::anyhow!("Failed to receive response: {}", e))
            }
            None => {
                self.connection = None;
                Err(anyhow::anyhow!("Connection closed by server"))
            }
        }
    }

    /// Send a command and wait for a single response.
    pub async fn request(&mut self, command: ControlCommand) -> Result<ControlResponse> {
        self.send(command).await?;
        self.receive().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}
