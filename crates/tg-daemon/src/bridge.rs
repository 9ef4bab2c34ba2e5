// bridge.rs — Pumping envelopes from the host through the guard.
//
// Lines are handled strictly in arrival order, so events of one session are
// never reordered. The guard is synchronous (it may touch disk for the audit
// log), so each event runs on the blocking pool. Challenges raised while an
// event is handled are written before that event's response.

use std::sync::Arc;

use anyhow::Result;
use tg_hooks::{Challenge, ChallengeNotifier, GuardError, HookResponse, TaintGuard};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::protocol::{decode, encode, Inbound, Outbound};

/// Forwards challenges to the bridge's output.
pub struct ChannelNotifier {
    tx: UnboundedSender<Challenge>,
}

impl ChannelNotifier {
    pub fn channel() -> (Self, UnboundedReceiver<Challenge>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChallengeNotifier for ChannelNotifier {
    fn notify(&self, challenge: &Challenge) -> Result<(), GuardError> {
        self.tx
            .send(challenge.clone())
            .map_err(|_| GuardError::Notify("daemon output closed".to_string()))
    }
}

/// Counters reported at shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub events: usize,
    pub malformed: usize,
    pub challenges: usize,
}

/// Serve until the reader reaches end of input.
pub async fn serve<R, W>(
    guard: Arc<TaintGuard>,
    challenges: &mut UnboundedReceiver<Challenge>,
    reader: R,
    mut writer: W,
) -> Result<BridgeStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = BridgeStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let (id, response) = match decode(&line) {
            Inbound::Event(envelope) => {
                stats.events += 1;
                let guard = guard.clone();
                let id = envelope.id;
                let session_key = envelope.session_key;
                let event = envelope.event;
                let response =
                    tokio::task::spawn_blocking(move || guard.handle(&session_key, event))
                        .await
                        .unwrap_or_else(|e| {
                            tracing::error!(error = %e, "hook task failed");
                            HookResponse::None
                        });
                (id, response)
            }
            Inbound::Malformed { id, error } => {
                stats.malformed += 1;
                tracing::warn!(%error, "malformed envelope; answering with no effect");
                (id, HookResponse::None)
            }
        };

        while let Ok(challenge) = challenges.try_recv() {
            stats.challenges += 1;
            write_message(&mut writer, &Outbound::Challenge(challenge)).await?;
        }
        write_message(&mut writer, &Outbound::Response { id, response }).await?;
    }

    Ok(stats)
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Outbound) -> Result<()> {
    let mut line = encode(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
