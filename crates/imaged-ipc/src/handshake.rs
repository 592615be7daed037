//! Session key agreement with a freshly started worker
//!
//! ```text
//! worker    → base64(public key PEM)
//! front end → base64(RSA-OAEP(session key))
//! worker    → base64(seal(session key, CHANNEL_ESTABLISHED))
//! ```
//!
//! Every line on the front-end side is bounded by the handshake timeout.

use std::time::Duration;

use imaged_core::{ImagedError, ImagedResult};
use imaged_crypto::{aead, parse_public_key_pem, wrap_session_key, SessionKey, WorkerIdentity};
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::transport::{read_frame_line, write_frame_line, LineReader, LineWriter};

/// Plaintext the worker seals to prove it recovered the session key
pub const CONFIRMATION_SENTINEL: &[u8] = b"CHANNEL_ESTABLISHED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    AwaitingPublicKey,
    AwaitingConfirmation,
    Established,
    Failed(String),
}

/// Front-end side of the handshake.
#[derive(Debug)]
pub struct Handshake {
    timeout: Duration,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: HandshakeState::NotStarted,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Run the handshake to completion. On error the state is `Failed` and
    /// the worker must be discarded.
    pub async fn perform(
        &mut self,
        reader: &mut LineReader,
        writer: &mut LineWriter,
    ) -> ImagedResult<SessionKey> {
        match self.run(reader, writer).await {
            Ok(key) => {
                self.state = HandshakeState::Established;
                tracing::debug!("secure channel established");
                Ok(key)
            }
            Err(e) => {
                self.state = HandshakeState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        reader: &mut LineReader,
        writer: &mut LineWriter,
    ) -> ImagedResult<SessionKey> {
        self.state = HandshakeState::AwaitingPublicKey;
        let pem_bytes = reader.next_frame(self.timeout).await?;
        let pem = std::str::from_utf8(&pem_bytes)
            .map_err(|_| ImagedError::ProtocolViolation("public key is not UTF-8".into()))?;
        let public = parse_public_key_pem(pem)
            .map_err(|e| ImagedError::ProtocolViolation(e.to_string()))?;

        let session = SessionKey::generate();
        let wrapped = wrap_session_key(&public, &session)
            .map_err(|e| ImagedError::ProtocolViolation(e.to_string()))?;
        writer.send_frame(&wrapped).await?;

        self.state = HandshakeState::AwaitingConfirmation;
        let sealed = reader.next_frame(self.timeout).await?;
        let confirmation = aead::open(&session, &sealed)
            .map_err(|e| ImagedError::AuthFailure(format!("handshake confirmation: {e}")))?;
        if confirmation != CONFIRMATION_SENTINEL {
            return Err(ImagedError::ProtocolViolation(
                "unexpected handshake confirmation".into(),
            ));
        }
        Ok(session)
    }
}

/// Worker side: publish the public key, unwrap the session key, confirm.
pub async fn accept_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    identity: &WorkerIdentity,
) -> ImagedResult<SessionKey>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let pem = identity
        .public_key_pem()
        .map_err(|e| ImagedError::Other(e.into()))?;
    write_frame_line(writer, pem.as_bytes()).await?;

    let wrapped = read_frame_line(reader)
        .await?
        .ok_or_else(|| ImagedError::ProcessDied("input closed during handshake".into()))?;
    let session = identity
        .unwrap_session_key(&wrapped)
        .map_err(|e| ImagedError::AuthFailure(e.to_string()))?;

    let confirmation = aead::seal(&session, CONFIRMATION_SENTINEL)
        .map_err(|e| ImagedError::Other(anyhow::anyhow!("sealing confirmation: {e}")))?;
    write_frame_line(writer, &confirmation).await?;
    Ok(session)
}
