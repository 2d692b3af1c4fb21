//! Node runtime over a line-oriented byte stream
//!
//! Reads envelopes line by line. Nothing is handled until an `init` message
//! assigns this process its node identity; after that every line is routed
//! to the node built for that identity.
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FloodcastError, Result};
use crate::node::{Handler, Message, Payload};
use crate::settings::Settings;
use crate::transport::stdio::spawn_writer;
use crate::transport::{route_inbound, StdioTransport, Transport};

/// Serve requests from `reader`, writing envelopes to `writer`, until the input closes.
///
/// `build` constructs the node once its identity is known.
pub async fn run<R, W, F, H>(settings: &Settings, reader: R, writer: W, build: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(Arc<StdioTransport>, &Settings) -> Result<Arc<H>>,
    H: Handler,
{
    let (outbox, writer_task) = spawn_writer(writer);
    let mut lines = reader.lines();

    let (transport, node) = loop {
        let Some(line) = lines.next_line().await? else {
            info!("Input closed before init");
            return drain_output(outbox, writer_task).await;
        };
        let msg = match Message::parse(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Skipping unparseable envelope: {}", e);
                continue;
            }
        };

        match msg.payload() {
            Ok(Payload::Init { node_id, node_ids }) => {
                info!(
                    "[{}] Initialized in a cluster of {} nodes: {:?}",
                    node_id,
                    node_ids.len(),
                    node_ids
                );
                let transport = Arc::new(StdioTransport::new(node_id, outbox.clone()));
                transport.reply(&msg, Payload::InitOk).await?;
                let node = build(Arc::clone(&transport), settings)?;
                break (transport, node);
            }
            _ => {
                warn!(
                    "Received {} from {} before init",
                    msg.kind().unwrap_or("<untyped>"),
                    msg.src
                );
                reject_before_init(&outbox, &msg)?;
            }
        }
    };

    while let Some(line) = lines.next_line().await? {
        match Message::parse(&line) {
            Ok(msg) => {
                debug!("[{}] <- {}", transport.node_id(), line);
                route_inbound(&transport, transport.correlator(), &node, msg);
            }
            Err(e) => warn!("[{}] Skipping unparseable envelope: {}", transport.node_id(), e),
        }
    }

    info!("[{}] Input closed, shutting down", transport.node_id());
    node.shutdown().await;
    drop(node);
    drop(transport);
    drain_output(outbox, writer_task).await
}

/// Release this side's sender and wait until every queued line is written.
///
/// The writer exits once all senders are gone, which includes those held by
/// handler tasks still finishing their replies.
async fn drain_output(
    outbox: mpsc::UnboundedSender<String>,
    writer_task: JoinHandle<Result<()>>,
) -> Result<()> {
    drop(outbox);
    writer_task
        .await
        .map_err(|e| FloodcastError::Transport(format!("output writer failed: {}", e)))?
}

/// Answer a pre-init request so its sender is not left waiting
fn reject_before_init(
    outbox: &mpsc::UnboundedSender<String>,
    msg: &Message,
) -> Result<()> {
    let Some(msg_id) = msg.msg_id() else {
        return Ok(());
    };
    let reply = Message::new(
        msg.dest.clone(),
        msg.src.clone(),
        &Payload::error(&FloodcastError::Uninitialized),
        None,
        Some(msg_id),
    )?;
    outbox
        .send(reply.to_line()?)
        .map_err(|_| FloodcastError::Transport("output writer has shut down".to_string()))
}
