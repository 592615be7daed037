//! Encrypted, strictly serialized command channel
//!
//! One exchange holds the channel lock from sending the command until the
//! whole reply (metadata and optional payload) has been read, so concurrent
//! callers never interleave on the wire.

use std::time::Duration;

use imaged_core::{Command, ImagedError, ImagedResult, Reply, Response, StreamMetadata};
use imaged_crypto::{aead, SessionKey};
use tokio::sync::Mutex;

use crate::framing::frame;
use crate::handshake::Handshake;
use crate::transport::{BoxedReader, BoxedWriter, LineReader, LineWriter};

struct ChannelIo {
    reader: LineReader,
    writer: LineWriter,
}

pub struct SecureChannel {
    io: Mutex<ChannelIo>,
    key: SessionKey,
    timeout: Duration,
}

impl SecureChannel {
    /// Run the handshake over the given streams and wrap them in a channel.
    pub async fn establish(
        reader: BoxedReader,
        writer: BoxedWriter,
        handshake_timeout: Duration,
        command_timeout: Duration,
    ) -> ImagedResult<Self> {
        let mut reader = LineReader::spawn(reader);
        let mut writer = LineWriter::new(writer);
        let key = Handshake::new(handshake_timeout)
            .perform(&mut reader, &mut writer)
            .await?;
        Ok(Self {
            io: Mutex::new(ChannelIo { reader, writer }),
            key,
            timeout: command_timeout,
        })
    }

    /// Send one command and read its complete reply.
    pub async fn exchange(&self, command: &Command) -> ImagedResult<Reply> {
        let sealed = aead::seal(&self.key, &command.to_bytes()?)
            .map_err(|e| ImagedError::Other(anyhow::anyhow!("sealing command: {e}")))?;
        let framed = frame(&sealed).map_err(|e| ImagedError::Framing(e.to_string()))?;

        let mut io = self.io.lock().await;
        let stale = io.reader.discard_pending();
        if stale > 0 {
            tracing::warn!(stale, "discarded unread worker output before exchange");
        }

        tracing::debug!(command = command.name(), "sending command");
        io.writer.send_frame(&framed).await?;

        let metadata_bytes = self.open(io.reader.next_frame(self.timeout).await?)?;
        let metadata = StreamMetadata::from_bytes(&metadata_bytes)?;
        if !metadata.has_payload {
            return Ok(Reply::Single(metadata.response));
        }

        let payload = self.open(io.reader.next_frame(self.timeout).await?)?;
        Ok(Reply::Streamed {
            metadata: metadata.response,
            payload,
        })
    }

    /// Like [`exchange`](Self::exchange), but every failure becomes a
    /// `success: false` response.
    pub async fn send(&self, command: &Command) -> Response {
        self.send_streamed(command).await.into_response()
    }

    pub async fn send_streamed(&self, command: &Command) -> Reply {
        match self.exchange(command).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(command = command.name(), "exchange failed: {e}");
                Reply::Single(Response::failure(e.to_string()))
            }
        }
    }

    fn open(&self, sealed: Vec<u8>) -> ImagedResult<Vec<u8>> {
        aead::open(&self.key, &sealed).map_err(|e| ImagedError::AuthFailure(e.to_string()))
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
