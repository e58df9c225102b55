//! Byte-stream transport for the presentation side of the bridge.
//!
//! Commands are decoded from `reader`, events are framed onto `writer`.
//! The binary runs this over stdin/stdout.

use crate::bridge::PresentationSide;
use hostdeck_core::{frame_encode, DeckError, DeckResult, FrameDecoder, Inbound, Outbound, WireFormat};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 16 * 1024;

/// Serve one presentation connection until the engine closes the bridge.
///
/// End of input is turned into a `Shutdown` command. Undecodable input is
/// answered with `CommandRejected` and skipped.
pub async fn serve<R, W>(
    side: PresentationSide,
    format: WireFormat,
    reader: R,
    mut writer: W,
) -> DeckResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let PresentationSide {
        mut events,
        commands,
    } = side;
    let (reject_tx, mut rejects) = mpsc::channel::<Outbound>(16);

    let read_task = tokio::spawn(async move {
        let result = read_commands(reader, format, &commands, &reject_tx).await;
        if let Err(e) = &result {
            warn!(error = %e, "command stream failed");
        }
        // Nothing more will arrive; ask the engine to wind down.
        if commands.send(Inbound::Shutdown).await.is_err() {
            debug!("engine already gone");
        }
        result
    });

    let mut rejects_open = true;
    let written = loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    // Flush rejections that raced the engine's close.
                    let mut flushed = Ok(());
                    while let Ok(event) = rejects.try_recv() {
                        flushed = write_event(&mut writer, format, &event).await;
                        if flushed.is_err() {
                            break;
                        }
                    }
                    break flushed;
                }
            },
            rejected = rejects.recv(), if rejects_open => match rejected {
                Some(event) => event,
                None => {
                    rejects_open = false;
                    continue;
                }
            },
        };
        if let Err(e) = write_event(&mut writer, format, &event).await {
            break Err(e);
        }
    };

    read_task.abort();
    if let Err(e) = &written {
        warn!(error = %e, "event stream failed");
    }
    info!(delivered = events.stats().delivered, "transport closed");
    written
}

async fn read_commands<R>(
    mut reader: R,
    format: WireFormat,
    commands: &crate::bridge::CommandSender,
    rejects: &mpsc::Sender<Outbound>,
) -> DeckResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(format);
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!(pending = decoder.pending(), "command stream ended");
            return Ok(());
        }
        for decoded in decoder.feed::<Inbound>(&buf[..n]) {
            match decoded {
                Ok(command) => commands.send(command).await?,
                Err(e) => {
                    warn!(error = %e, "rejecting undecodable command");
                    if rejects.send(Outbound::rejected(None, &e)).await.is_err() {
                        debug!("event writer gone, rejection discarded");
                    }
                }
            }
        }
        if decoder.is_desynchronized() {
            return Err(DeckError::Codec("input framing lost".into()));
        }
    }
}

async fn write_event<W>(writer: &mut W, format: WireFormat, event: &Outbound) -> DeckResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = frame_encode(format, event)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
