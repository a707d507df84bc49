use std::sync::Arc;

use ptyhub_core::LogNotifier;
use ptyhub_core::NativePtyFactory;
use ptyhub_core::OwnerChannel;
use ptyhub_core::Supervisor;
use ptyhub_core::SupervisorConfig;
use ptyhub_protocol::ClientMessage;
use ptyhub_protocol::ServerMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Runs the stdio server until stdin closes. The stdio client is the only
/// owner; closing stdin releases its sessions and stops the supervisor.
pub async fn run(config: SupervisorConfig) -> anyhow::Result<()> {
    let supervisor = Supervisor::spawn(config, Arc::new(NativePtyFactory), Arc::new(LogNotifier));
    let (owner, mut events) = OwnerChannel::new();
    let mut broadcasts = supervisor.subscribe();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let mut line = serde_json::to_vec(&message)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let events_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if events_tx.send(ServerMessage::Event { event }).is_err() {
                break;
            }
        }
    });

    let broadcast_tx = out_tx.clone();
    tokio::spawn(async move {
        loop {
            match broadcasts.recv().await {
                Ok(event) => {
                    if broadcast_tx.send(ServerMessage::Broadcast { event }).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "broadcast receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!(owner = %owner.id(), "serving on stdio");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: ClientMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed request line");
                continue;
            }
        };
        let response = supervisor.handle_request(message.request, &owner).await;
        let reply = ServerMessage::Response {
            id: message.id,
            response,
        };
        if out_tx.send(reply).is_err() {
            break;
        }
    }

    debug!("stdin closed");
    supervisor.release_owner(owner.id()).await?;
    supervisor.shutdown().await?;
    drop(owner);
    drop(supervisor);
    drop(out_tx);
    writer.await??;
    Ok(())
}
