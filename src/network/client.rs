//! Replication TCP Client
//!
//! Outbound side of the replication protocol: one pooled connection per
//! master endpoint, a reader task per connection dispatching responses and
//! pushed chips to the response handler, and a small apply worker draining
//! scheduled write tasks into the local partitions.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{read_message, write_message, ReplClient, ResponseHandler};
use crate::binlog::{BinlogChip, BinlogOffset};
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::store::Partition;
use crate::replication::protocol::{ReplRequest, ReplResponse, WriteTask};
use crate::replication::{PartitionInfo, RmNode};
use async_trait::async_trait;

enum ApplyJob {
    Binlog {
        partition_key: String,
        tasks: Vec<WriteTask>,
    },
    Db {
        dispatch_key: String,
        chip: BinlogChip,
        table: String,
        partition_id: u32,
    },
}

struct ConnEntry {
    writer: OwnedWriteHalf,
    reader_task: tokio::task::JoinHandle<()>,
}

/// Pooled TCP client implementing the [`ReplClient`] seam
pub struct TcpReplClient {
    context: Arc<ServerContext>,
    handler: OnceLock<Arc<dyn ResponseHandler>>,
    conns: tokio::sync::Mutex<HashMap<String, ConnEntry>>,
    apply_tx: mpsc::UnboundedSender<ApplyJob>,
    apply_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    connect_timeout: Duration,
    local_port: u16,
}

impl TcpReplClient {
    /// Create the client; `handler` must be wired before responses arrive
    pub fn new(context: Arc<ServerContext>, connect_timeout: Duration) -> Arc<Self> {
        let local_port = context
            .config
            .node
            .bind_address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(0);

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            context,
            handler: OnceLock::new(),
            conns: tokio::sync::Mutex::new(HashMap::new()),
            apply_tx,
            apply_task: Mutex::new(None),
            connect_timeout,
            local_port,
        });
        let worker = tokio::spawn(run_apply_worker(Arc::clone(&client.context), apply_rx));
        *client.apply_task.lock() = Some(worker);
        client
    }

    /// Wire the response dispatcher; call once at startup
    pub fn set_handler(&self, handler: Arc<dyn ResponseHandler>) {
        let _ = self.handler.set(handler);
    }

    /// Stop the apply worker and drop every connection
    pub async fn stop(&self) {
        if let Some(task) = self.apply_task.lock().take() {
            task.abort();
        }
        let mut conns = self.conns.lock().await;
        for (_, entry) in conns.drain() {
            entry.reader_task.abort();
        }
    }

    async fn send(&self, ip: &str, port: u16, request: ReplRequest) -> Result<()> {
        let addr = format!("{ip}:{port}");
        let mut conns = self.conns.lock().await;

        if !conns.contains_key(&addr) {
            let entry = self.connect(ip, port).await?;
            conns.insert(addr.clone(), entry);
        }

        let entry = conns.get_mut(&addr).expect("connection just inserted");
        if let Err(e) = write_message(&mut entry.writer, &request).await {
            // The connection is dead; the next send reconnects
            let entry = conns.remove(&addr).expect("connection present");
            entry.reader_task.abort();
            return Err(e);
        }
        Ok(())
    }

    async fn connect(&self, ip: &str, port: u16) -> Result<ConnEntry> {
        let addr = format!("{ip}:{port}");
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::ConnectionTimeout(addr.clone()))?
            .map_err(|e| Error::ConnectionFailed {
                address: addr.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (mut reader, writer) = stream.into_split();
        let handler = self.handler.get().cloned();
        let peer = RmNode::new(ip, port, PartitionInfo::default());
        let reader_task = tokio::spawn(async move {
            loop {
                match read_message::<_, ReplResponse>(&mut reader).await {
                    Ok(resp) => {
                        let Some(handler) = handler.as_ref() else {
                            tracing::warn!("Dropping {} response: no handler", resp.type_name());
                            continue;
                        };
                        if let Err(e) = handler.handle_response(&peer, resp).await {
                            tracing::warn!("Handling response from {} failed: {e}", peer.addr());
                        }
                    }
                    Err(_) => {
                        tracing::debug!("Connection to {} closed", peer.addr());
                        break;
                    }
                }
            }
        });

        Ok(ConnEntry {
            writer,
            reader_task,
        })
    }
}

#[async_trait]
impl ReplClient for TcpReplClient {
    async fn send_meta_sync(&self, ip: &str, port: u16) -> Result<()> {
        let local_ip = self.context.config.node.bind_address.clone();
        let local_ip = local_ip.rsplit_once(':').map(|(ip, _)| ip).unwrap_or("");
        self.send(
            ip,
            port,
            ReplRequest::MetaSync {
                local_ip: local_ip.to_string(),
                port: self.local_port,
            },
        )
        .await
    }

    async fn send_partition_try_sync(
        &self,
        ip: &str,
        port: u16,
        table: &str,
        partition_id: u32,
        offset: BinlogOffset,
        local_ip: &str,
        master_term: u32,
    ) -> Result<()> {
        let node = RmNode::new(local_ip, self.local_port, PartitionInfo::new(table, partition_id));
        self.send(
            ip,
            port,
            ReplRequest::TrySync {
                node,
                offset,
                local_ip: local_ip.to_string(),
                master_term,
            },
        )
        .await
    }

    async fn send_partition_db_sync(
        &self,
        ip: &str,
        port: u16,
        table: &str,
        partition_id: u32,
        offset: BinlogOffset,
        local_ip: &str,
        master_term: u32,
    ) -> Result<()> {
        let node = RmNode::new(local_ip, self.local_port, PartitionInfo::new(table, partition_id));
        self.send(
            ip,
            port,
            ReplRequest::DbSync {
                node,
                offset,
                local_ip: local_ip.to_string(),
                master_term,
            },
        )
        .await
    }

    async fn send_partition_binlog_sync(
        &self,
        ip: &str,
        port: u16,
        table: &str,
        partition_id: u32,
        session_id: i32,
        ack_start: BinlogOffset,
        ack_end: BinlogOffset,
        local_ip: &str,
        is_first: bool,
    ) -> Result<()> {
        let node = RmNode::with_session(
            local_ip,
            self.local_port,
            PartitionInfo::new(table, partition_id),
            session_id,
        );
        self.send(
            ip,
            port,
            ReplRequest::BinlogSync {
                node,
                ack_start,
                ack_end,
                local_ip: local_ip.to_string(),
                is_first,
            },
        )
        .await
    }

    async fn send_remove_slave_node(
        &self,
        ip: &str,
        port: u16,
        table: &str,
        partition_id: u32,
        local_ip: &str,
        master_term: u32,
    ) -> Result<()> {
        let node = RmNode::new(local_ip, self.local_port, PartitionInfo::new(table, partition_id));
        self.send(
            ip,
            port,
            ReplRequest::RemoveSlaveNode {
                node,
                local_ip: local_ip.to_string(),
                master_term,
            },
        )
        .await
    }

    async fn close(&self, ip: &str, port: u16) -> Result<()> {
        let addr = format!("{ip}:{port}");
        if let Some(entry) = self.conns.lock().await.remove(&addr) {
            entry.reader_task.abort();
        }
        Ok(())
    }

    fn schedule_write_binlog_task(&self, partition_key: &str, tasks: Vec<WriteTask>) {
        let _ = self.apply_tx.send(ApplyJob::Binlog {
            partition_key: partition_key.to_string(),
            tasks,
        });
    }

    fn schedule_write_db_task(
        &self,
        dispatch_key: &str,
        chip: BinlogChip,
        table: &str,
        partition_id: u32,
    ) {
        let _ = self.apply_tx.send(ApplyJob::Db {
            dispatch_key: dispatch_key.to_string(),
            chip,
            table: table.to_string(),
            partition_id,
        });
    }
}

/// Drain scheduled apply jobs into the local partitions
async fn run_apply_worker(
    context: Arc<ServerContext>,
    mut rx: mpsc::UnboundedReceiver<ApplyJob>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            ApplyJob::Binlog {
                partition_key,
                tasks,
            } => {
                for task in tasks {
                    let info = &task.target.partition;
                    match context.partition(info) {
                        Ok(partition) => {
                            partition.binlog().append(&task.chip.payload);
                        }
                        Err(e) => {
                            tracing::warn!("Apply for '{partition_key}' failed: {e}");
                            break;
                        }
                    }
                }
            }
            ApplyJob::Db {
                dispatch_key,
                chip,
                table,
                partition_id,
            } => {
                tracing::debug!(
                    "Apply db write '{dispatch_key}' for {table}:{partition_id} at {}",
                    chip.offset
                );
            }
        }
    }
}
