//! Fan-Out Write Queue
//!
//! Every peer endpoint owns a FIFO of outbound write tasks. The drain packs
//! tasks into size-capped batches pulled from a fixed buffer cache and
//! hands them to the replication server; batches are built under the queue
//! mutex, sends happen with no locks held.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::protocol::WriteTask;
use super::task_cache::TaskCache;
use super::{BINLOG_SEND_BATCH_NUM, BINLOG_SEND_PACKET_NUM, MAX_SEND_BATCH_BYTES};
use crate::network::ReplServer;

/// Per-peer outbound task queues
pub struct WriteQueueManager {
    queues: Mutex<HashMap<String, VecDeque<WriteTask>>>,
    buffers: Arc<TaskCache<Vec<WriteTask>>>,
    max_batch_bytes: usize,
}

impl WriteQueueManager {
    /// Create a manager with `buffer_count` preallocated batch buffers
    pub fn new(buffer_count: usize) -> Self {
        Self::with_byte_cap(buffer_count, MAX_SEND_BATCH_BYTES)
    }

    /// Create a manager with a custom batch byte cap
    pub fn with_byte_cap(buffer_count: usize, max_batch_bytes: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            buffers: TaskCache::new(buffer_count, || {
                Vec::with_capacity(BINLOG_SEND_BATCH_NUM)
            }),
            max_batch_bytes,
        }
    }

    /// Append tasks to a peer's queue
    pub fn produce(&self, ip: &str, port: u16, tasks: Vec<WriteTask>) {
        let mut queues = self.queues.lock();
        queues
            .entry(peer_key(ip, port))
            .or_default()
            .extend(tasks);
    }

    /// Erase a peer's queue
    pub fn drop_queue(&self, ip: &str, port: u16) {
        self.queues.lock().remove(&peer_key(ip, port));
    }

    /// Tasks currently queued for a peer
    pub fn pending_tasks(&self, ip: &str, port: u16) -> Vec<WriteTask> {
        self.queues
            .lock()
            .get(&peer_key(ip, port))
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drain each peer's queue in up to 40 batches of up to 100 tasks,
    /// capped by payload bytes. Returns the number of tasks dispatched; a
    /// failed send drops the peer's whole queue and the timeout sweep
    /// evicts the slave later. A drained buffer cache defers the remaining
    /// peers to the next pass.
    pub async fn consume(&self, server: &dyn ReplServer) -> usize {
        let mut to_send = Vec::new();
        let mut counter = 0;
        {
            let mut queues = self.queues.lock();
            'peers: for (peer, queue) in queues.iter_mut() {
                let mut batches = Vec::new();
                for _ in 0..BINLOG_SEND_PACKET_NUM {
                    if queue.is_empty() {
                        break;
                    }
                    let mut buf = match self.buffers.get() {
                        Some(buf) => buf,
                        None => {
                            tracing::debug!("write queue buffers drained, deferring peers");
                            if !batches.is_empty() {
                                to_send.push((peer.clone(), batches));
                            }
                            break 'peers;
                        }
                    };
                    buf.clear();

                    let mut batch_bytes = 0usize;
                    while buf.len() < BINLOG_SEND_BATCH_NUM {
                        let payload_len = match queue.front() {
                            Some(task) => task.chip.payload.len(),
                            None => break,
                        };
                        if !buf.is_empty() && batch_bytes + payload_len > self.max_batch_bytes {
                            break;
                        }
                        batch_bytes += payload_len;
                        buf.push(queue.pop_front().expect("peeked task vanished"));
                        counter += 1;
                    }
                    batches.push(buf);
                }
                if !batches.is_empty() {
                    to_send.push((peer.clone(), batches));
                }
            }
        }

        for (peer, batches) in to_send {
            let (ip, port) = match parse_peer_key(&peer) {
                Some(addr) => addr,
                None => {
                    tracing::warn!("Unparseable peer key '{peer}' in write queue");
                    continue;
                }
            };
            let mut failed = false;
            for buf in batches {
                if failed {
                    continue;
                }
                if let Err(e) = server.send_slave_binlog_chips(&ip, port, buf.as_slice()).await {
                    tracing::warn!("Send binlog to {ip}:{port} failed, {e}");
                    self.drop_queue(&ip, port);
                    failed = true;
                }
            }
        }
        counter
    }
}

fn peer_key(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}

fn parse_peer_key(key: &str) -> Option<(String, u16)> {
    let (ip, port) = key.rsplit_once(':')?;
    Some((ip.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{BinlogChip, BinlogOffset};
    use crate::network::mock::RecordingServer;
    use crate::replication::node::{PartitionInfo, RmNode};
    use std::sync::atomic::Ordering;

    fn task(byte: u64, payload_len: usize) -> WriteTask {
        WriteTask::new(
            RmNode::new("10.0.0.2", 9221, PartitionInfo::new("db0", 0)),
            1,
            BinlogChip::new(BinlogOffset::new(0, byte), vec![0u8; payload_len]),
        )
    }

    #[tokio::test]
    async fn test_produce_and_consume() {
        let wq = WriteQueueManager::new(8);
        let server = RecordingServer::default();

        wq.produce("10.0.0.2", 9221, vec![task(10, 4), task(20, 4)]);
        wq.produce("10.0.0.3", 9221, vec![task(10, 4)]);

        let sent = wq.consume(&server).await;
        assert_eq!(sent, 3);
        assert_eq!(server.batches().len(), 2);
        assert!(wq.pending_tasks("10.0.0.2", 9221).is_empty());
    }

    #[tokio::test]
    async fn test_batch_task_cap() {
        let wq = WriteQueueManager::new(8);
        let server = RecordingServer::default();

        let tasks = (0..BINLOG_SEND_BATCH_NUM as u64 + 30)
            .map(|i| task(i, 1))
            .collect();
        wq.produce("10.0.0.2", 9221, tasks);

        let sent = wq.consume(&server).await;
        assert_eq!(sent, BINLOG_SEND_BATCH_NUM + 30);

        let batches = server.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].1.len(), BINLOG_SEND_BATCH_NUM);
        assert_eq!(batches[1].1.len(), 30);
    }

    #[tokio::test]
    async fn test_batch_byte_cap() {
        let wq = WriteQueueManager::with_byte_cap(8, 64);
        let server = RecordingServer::default();

        // 40 + 40 overflows the cap, 40 + 10 does not
        wq.produce(
            "10.0.0.2",
            9221,
            vec![task(1, 40), task(2, 40), task(3, 10)],
        );

        let sent = wq.consume(&server).await;
        assert_eq!(sent, 3);
        let batches = server.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].1.len(), 1);
        assert_eq!(batches[1].1.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_send_drops_peer_queue() {
        let wq = WriteQueueManager::new(8);
        let server = RecordingServer::default();
        server.fail_sends.store(true, Ordering::Relaxed);

        wq.produce("10.0.0.2", 9221, vec![task(10, 4), task(20, 4)]);
        wq.consume(&server).await;

        assert!(server.batches().is_empty());
        assert!(wq.pending_tasks("10.0.0.2", 9221).is_empty());

        // The peer is usable again after the failure
        server.fail_sends.store(false, Ordering::Relaxed);
        wq.produce("10.0.0.2", 9221, vec![task(30, 4)]);
        assert_eq!(wq.consume(&server).await, 1);
        assert_eq!(server.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_backpressure_defers_tasks() {
        // One buffer: the second batch of the pass cannot be built
        let wq = WriteQueueManager::new(1);
        let server = RecordingServer::default();

        let tasks = (0..BINLOG_SEND_BATCH_NUM as u64 + 10)
            .map(|i| task(i, 1))
            .collect();
        wq.produce("10.0.0.2", 9221, tasks);

        let sent = wq.consume(&server).await;
        assert_eq!(sent, BINLOG_SEND_BATCH_NUM);
        assert_eq!(wq.pending_tasks("10.0.0.2", 9221).len(), 10);

        // The buffer came home; the next pass drains the rest
        let sent = wq.consume(&server).await;
        assert_eq!(sent, 10);
        assert!(wq.pending_tasks("10.0.0.2", 9221).is_empty());
    }

    #[tokio::test]
    async fn test_drop_queue() {
        let wq = WriteQueueManager::new(8);
        wq.produce("10.0.0.2", 9221, vec![task(10, 4)]);
        wq.drop_queue("10.0.0.2", 9221);
        assert!(wq.pending_tasks("10.0.0.2", 9221).is_empty());
    }
}
