//! Duplex stream transport.
//!
//! The reader decodes one envelope per line and dispatches it before reading the next.
//! Execute and stop are enqueued with the session manager in arrival order; their
//! results are awaited on spawned tasks so engine work never blocks reading.
//!
//! Everything written goes through [`Outbound`] to a single writer task, so lines from
//! different executions interleave only at line granularity.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::Envelope;
use crate::manager::SessionManager;
use crate::shutdown::ShutdownCoordinator;

/// Cloneable handle to the writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an envelope. Returns false once the writer is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::SendError(envelope)) => {
                tracing::debug!(kind = envelope.kind(), "Writer closed, dropping envelope");
                false
            }
        }
    }
}

/// Write queued envelopes until `close` fires, then drain what is already queued.
pub async fn run_writer<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    close: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, EnvelopeCodec::new());

    loop {
        tokio::select! {
            biased;
            envelope = rx.recv() => match envelope {
                Some(envelope) => sink.send(envelope).await?,
                None => break,
            },
            _ = close.cancelled() => {
                rx.close();
                while let Some(envelope) = rx.recv().await {
                    sink.feed(envelope).await?;
                }
                break;
            }
        }
    }

    sink.flush().await?;
    tracing::debug!("Writer closed");
    Ok(())
}

/// Read and dispatch inbound envelopes until the stream ends.
pub async fn run_reader<R>(
    reader: R,
    max_line_length: usize,
    manager: SessionManager,
    outbound: Outbound,
    shutdown: ShutdownCoordinator,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, EnvelopeCodec::with_max_length(max_line_length));

    while let Some(frame) = lines.next().await {
        if shutdown.is_shutting_down() {
            tracing::debug!("Ignoring inbound envelope during shutdown");
            continue;
        }
        match frame {
            Ok(Ok(envelope)) => dispatch(envelope, &manager, &outbound),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Malformed inbound envelope");
                outbound.send(Envelope::error(None, e.to_string(), None));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Inbound stream read failed");
                break;
            }
        }
    }

    tracing::info!("Inbound stream closed");
}

fn dispatch(envelope: Envelope, manager: &SessionManager, outbound: &Outbound) {
    match envelope {
        Envelope::Ping => {
            outbound.send(Envelope::pong());
        }
        Envelope::Execute { request } => {
            let execution_id = request.execution_id.clone();
            tracing::debug!(%execution_id, "Execute received");
            let started = manager.start(request);
            tokio::spawn(async move {
                if let Err(e) = started.await {
                    tracing::warn!(%execution_id, error = %e, "Execute rejected");
                }
            });
        }
        Envelope::Stop { execution_id } => {
            tracing::debug!(%execution_id, "Stop received");
            let stopped = manager.stop(&execution_id);
            tokio::spawn(async move {
                if let Err(e) = stopped.await {
                    tracing::warn!(%execution_id, error = %e, "Stop rejected");
                }
            });
        }
        other => {
            let kind = other.kind();
            tracing::warn!(kind, "Unexpected inbound envelope");
            outbound.send(Envelope::error(
                None,
                format!("unexpected envelope: {kind}"),
                Some(serde_json::json!({ "type": kind })),
            ));
        }
    }
}
