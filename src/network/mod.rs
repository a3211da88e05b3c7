//! Network Layer
//!
//! Framed TCP transport for the replication protocol. The coordinator only
//! sees the [`ReplClient`] and [`ReplServer`] seams; the TCP implementations
//! live in `client` and `server`. Frames are length-prefixed bincode
//! messages with a crc32 checksum.

mod client;
mod server;

pub use client::TcpReplClient;
pub use server::NetworkServer;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::binlog::{BinlogChip, BinlogOffset};
use crate::error::{Error, Result};
use crate::replication::protocol::{FrameHeader, ReplResponse, WriteTask};
use crate::replication::RmNode;

/// Outbound RPC surface used by slave partitions
#[async_trait]
pub trait ReplClient: Send + Sync {
    /// Handshake with the configured master before partition-level sync
    async fn send_meta_sync(&self, ip: &str, port: u16) -> Result<()>;

    /// Ask a master to serve binlog catch-up from `offset`
    #[allow(clippy::too_many_arguments)]
    async fn send_partition_try_sync(
        &self,
        ip: &str,
        port: u16,
        table: &str,
        partition_id: u32,
        offset: BinlogOffset,
        local_ip: &str,
        master_term: u32,
    ) -> Result<()>;

    /// Ask a master for a full state transfer
    #[allow(clippy::too_many_arguments)]
    async fn send_partition_db_sync(
        &self,
        ip: &str,
        port: u16,
        table: &str,
        partition_id: u32,
        offset: BinlogOffset,
        local_ip: &str,
        master_term: u32,
    ) -> Result<()>;

    /// Acknowledge a contiguous range of applied binlog chips under the
    /// session granted at handshake
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Tell a master to drop this replica
    async fn send_remove_slave_node(
        &self,
        ip: &str,
        port: u16,
        table: &str,
        partition_id: u32,
        local_ip: &str,
        master_term: u32,
    ) -> Result<()>;

    /// Tear down the connection to a peer
    async fn close(&self, ip: &str, port: u16) -> Result<()>;

    /// Queue received binlog chips for application to the local partition
    fn schedule_write_binlog_task(&self, partition_key: &str, tasks: Vec<WriteTask>);

    /// Queue one parsed write for the local storage engine
    fn schedule_write_db_task(
        &self,
        dispatch_key: &str,
        chip: BinlogChip,
        table: &str,
        partition_id: u32,
    );
}

/// Inbound RPC surface used by master partitions
#[async_trait]
pub trait ReplServer: Send + Sync {
    /// Push a batch of binlog chips down a slave's connection
    async fn send_slave_binlog_chips(
        &self,
        ip: &str,
        port: u16,
        tasks: &[WriteTask],
    ) -> Result<()>;

    /// Drop a client connection by id
    fn remove_client_conn(&self, conn_id: u64);

    /// Bind a slave's `ip:port` identity to a live connection
    fn update_client_conn_map(&self, ip_port: &str, conn_id: u64);
}

/// Dispatch of requests arriving at this node's replication endpoint.
/// `None` means the request carries no reply (binlog acks).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        conn_id: u64,
        req: crate::replication::protocol::ReplRequest,
    ) -> Result<Option<ReplResponse>>;

    /// Called when a connection bound to a replica identity drops
    async fn handle_connection_lost(&self, addr: &str) {
        let _ = addr;
    }
}

/// Dispatch of responses and pushes arriving on outbound connections
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle_response(&self, peer: &RmNode, resp: ReplResponse) -> Result<()>;
}

/// Write one length-prefixed, checksummed message
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(msg)?;
    let header = FrameHeader::new(&data);
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed, checksummed message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    let mut data = vec![0u8; header.length as usize];
    reader.read_exact(&mut data).await?;

    if crc32fast::hash(&data) != header.checksum {
        return Err(Error::Network("frame checksum mismatch".into()));
    }
    Ok(bincode::deserialize(&data)?)
}
