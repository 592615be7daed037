//! Worker side of the channel: handshake, then a sequential command loop

use std::future::Future;

use imaged_core::{Command, ImagedError, ImagedResult, Reply, Response};
use imaged_crypto::{aead, SessionKey, WorkerIdentity};
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::framing::unframe;
use crate::handshake::accept_handshake;
use crate::transport::{read_frame_line, write_frame_line};

/// Reply sent when a command frame fails to decode or authenticate.
pub const COMMUNICATION_ERROR: &str = "Communication error";

/// Executes decoded commands. Failures are reported inside the [`Reply`].
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: Command) -> impl Future<Output = Reply> + Send;
}

/// Serve one front end until its input closes.
pub async fn serve<R, W, H>(
    mut reader: R,
    mut writer: W,
    identity: &WorkerIdentity,
    handler: &H,
) -> ImagedResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    H: CommandHandler,
{
    let session = accept_handshake(&mut reader, &mut writer, identity).await?;
    tracing::info!("secure channel established");

    while let Some(line) = read_frame_line(&mut reader).await? {
        let reply = match decode_command(&session, &line) {
            Ok(command) => {
                tracing::debug!(command = command.name(), "handling command");
                handler.handle(command).await
            }
            Err(e) => {
                tracing::warn!("rejecting command frame: {e}");
                Reply::Single(Response::failure(COMMUNICATION_ERROR))
            }
        };
        write_reply(&mut writer, &session, &reply).await?;
    }

    tracing::info!("input closed, shutting down");
    Ok(())
}

fn decode_command(session: &SessionKey, line: &[u8]) -> ImagedResult<Command> {
    let sealed = unframe(line).map_err(|e| ImagedError::Framing(e.to_string()))?;
    let plaintext =
        aead::open(session, sealed).map_err(|e| ImagedError::AuthFailure(e.to_string()))?;
    Command::from_bytes(&plaintext)
}

async fn write_reply<W>(writer: &mut W, session: &SessionKey, reply: &Reply) -> ImagedResult<()>
where
    W: AsyncWrite + Unpin,
{
    let seal = |bytes: &[u8]| {
        aead::seal(session, bytes)
            .map_err(|e| ImagedError::Other(anyhow::anyhow!("sealing reply: {e}")))
    };

    write_frame_line(writer, &seal(&reply.metadata().to_bytes()?)?).await?;
    if let Reply::Streamed { payload, .. } = reply {
        write_frame_line(writer, &seal(payload)?).await?;
    }
    Ok(())
}
