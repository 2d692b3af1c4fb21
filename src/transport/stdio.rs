//! Line-oriented JSON transport
//!
//! Each envelope is written as a single JSON line. All writes funnel through
//! one writer task so concurrent senders never interleave partial lines.
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{Correlator, ReplyCallback, Transport};
use crate::error::{FloodcastError, Result};
use crate::node::{Message, MsgId, NodeId, Payload};
use crate::protocol_error;

#[derive(Debug)]
pub struct StdioTransport {
    node_id: NodeId,
    correlator: Correlator,
    outbox: mpsc::UnboundedSender<String>,
}

impl StdioTransport {
    pub fn new(node_id: NodeId, outbox: mpsc::UnboundedSender<String>) -> Self {
        Self {
            node_id,
            correlator: Correlator::new(),
            outbox,
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    fn write(&self, msg: &Message) -> Result<()> {
        let line = msg.to_line()?;
        debug!("[{}] -> {}", self.node_id, line);
        self.outbox
            .send(line)
            .map_err(|_| FloodcastError::Transport("output writer has shut down".to_string()))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn send(&self, dest: &NodeId, payload: Payload) -> Result<()> {
        let msg = Message::new(self.node_id.clone(), dest.clone(), &payload, None, None)?;
        self.write(&msg)
    }

    async fn rpc(
        &self,
        dest: &NodeId,
        payload: Payload,
        callback: ReplyCallback,
    ) -> Result<MsgId> {
        let msg_id = self.correlator.next_msg_id();
        let msg = Message::new(
            self.node_id.clone(),
            dest.clone(),
            &payload,
            Some(msg_id),
            None,
        )?;
        self.correlator.register(msg_id, callback)?;
        if let Err(e) = self.write(&msg) {
            if let Err(forget_err) = self.forget(msg_id) {
                error!(
                    "[{}] Failed releasing callback {}: {}",
                    self.node_id, msg_id, forget_err
                );
            }
            return Err(e);
        }
        Ok(msg_id)
    }

    async fn reply(&self, request: &Message, payload: Payload) -> Result<()> {
        let in_reply_to = request.msg_id().ok_or_else(|| {
            protocol_error!(
                "cannot reply to {} from {} without msg_id",
                request.kind().unwrap_or("<untyped>"),
                request.src
            )
        })?;
        let msg = Message::new(
            self.node_id.clone(),
            request.src.clone(),
            &payload,
            None,
            Some(in_reply_to),
        )?;
        self.write(&msg)
    }

    fn forget(&self, msg_id: MsgId) -> Result<bool> {
        self.correlator
            .take(msg_id)
            .map(|callback| callback.is_some())
    }
}

/// Spawn the task that owns the output stream
pub fn spawn_writer<W>(mut writer: W) -> (mpsc::UnboundedSender<String>, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!("Output write failed: {}", e);
                return Err(FloodcastError::Io(e));
            }
            writer.flush().await?;
        }
        Ok::<(), FloodcastError>(())
    });
    (tx, handle)
}
