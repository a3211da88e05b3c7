//! Replication TCP Server
//!
//! Inbound side of the replication protocol. Every accepted connection
//! gets a reader loop dispatching requests to the handler and a writer
//! task draining a per-connection channel. A slave that handshakes binds
//! its `ip:port` identity to its connection, which is how pushed binlog
//! chips find their way back down.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::{read_message, write_message, ReplServer, RequestHandler};
use crate::error::{Error, Result};
use crate::replication::protocol::{ReplRequest, ReplResponse, WriteTask};
use async_trait::async_trait;

/// TCP server implementing the [`ReplServer`] seam
pub struct NetworkServer {
    handler: OnceLock<Arc<dyn RequestHandler>>,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<ReplResponse>>>,
    addr_conns: Mutex<HashMap<String, u64>>,
    next_conn_id: AtomicU64,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NetworkServer {
    /// Create an idle server; `start` binds and accepts
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: OnceLock::new(),
            conns: Mutex::new(HashMap::new()),
            addr_conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            accept_task: Mutex::new(None),
        })
    }

    /// Wire the request dispatcher; call once before `start`
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        let _ = self.handler.set(handler);
    }

    /// Bind and start accepting, returning the bound address. Failure to
    /// bind is fatal to the caller.
    pub async fn start(self: &Arc<Self>, bind_address: &str) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| Error::Network(format!("bind {bind_address} failed: {e}")))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Replication server listening on {local_addr}");

        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let conn_id = server.next_conn_id.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!("Accepted {peer} as conn {conn_id}");
                        tokio::spawn(Arc::clone(&server).run_conn(stream, conn_id));
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting and drop every connection
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.conns.lock().clear();
        self.addr_conns.lock().clear();
    }

    async fn run_conn(self: Arc<Self>, stream: TcpStream, conn_id: u64) {
        let (mut reader, mut writer) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ReplResponse>();
        self.conns.lock().insert(conn_id, tx.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(resp) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &resp).await {
                    tracing::debug!("Write on conn {conn_id} failed: {e}");
                    break;
                }
            }
        });

        loop {
            let req = match read_message::<_, ReplRequest>(&mut reader).await {
                Ok(req) => req,
                Err(_) => break,
            };
            let Some(handler) = self.handler.get() else {
                tracing::warn!("Dropping {} request: no handler", req.type_name());
                continue;
            };
            let req_name = req.type_name();
            match handler.handle_request(conn_id, req).await {
                Ok(Some(resp)) => {
                    if tx.send(resp).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Handling {req_name} on conn {conn_id} failed: {e}");
                }
            }
        }

        // Connection gone: unbind it and tell the handler who dropped
        self.conns.lock().remove(&conn_id);
        let lost: Vec<String> = {
            let mut addr_conns = self.addr_conns.lock();
            let lost = addr_conns
                .iter()
                .filter(|(_, id)| **id == conn_id)
                .map(|(addr, _)| addr.clone())
                .collect::<Vec<_>>();
            addr_conns.retain(|_, id| *id != conn_id);
            lost
        };
        if let Some(handler) = self.handler.get() {
            for addr in lost {
                handler.handle_connection_lost(&addr).await;
            }
        }
        writer_task.abort();
    }
}

#[async_trait]
impl ReplServer for NetworkServer {
    async fn send_slave_binlog_chips(
        &self,
        ip: &str,
        port: u16,
        tasks: &[WriteTask],
    ) -> Result<()> {
        let addr = format!("{ip}:{port}");
        let conn_id = self
            .addr_conns
            .lock()
            .get(&addr)
            .copied()
            .ok_or_else(|| Error::Network(format!("no connection bound to {addr}")))?;
        let tx = self
            .conns
            .lock()
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| Error::Network(format!("conn {conn_id} for {addr} is gone")))?;
        tx.send(ReplResponse::BinlogChips {
            tasks: tasks.to_vec(),
        })
        .map_err(|_| Error::Network(format!("conn {conn_id} for {addr} is closed")))
    }

    fn remove_client_conn(&self, conn_id: u64) {
        self.conns.lock().remove(&conn_id);
        self.addr_conns.lock().retain(|_, id| *id != conn_id);
    }

    fn update_client_conn_map(&self, ip_port: &str, conn_id: u64) {
        self.addr_conns.lock().insert(ip_port.to_string(), conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{BinlogChip, BinlogOffset};
    use crate::replication::{PartitionInfo, RmNode};

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle_request(
            &self,
            _conn_id: u64,
            req: ReplRequest,
        ) -> Result<Option<ReplResponse>> {
            match req {
                ReplRequest::MetaSync { .. } => Ok(Some(ReplResponse::MetaSync { ok: true })),
                _ => Ok(None),
            }
        }
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let server = NetworkServer::new();
        server.set_handler(Arc::new(EchoHandler));
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(
            &mut stream,
            &ReplRequest::MetaSync {
                local_ip: "127.0.0.1".into(),
                port: 4321,
            },
        )
        .await
        .unwrap();
        let resp: ReplResponse = read_message(&mut stream).await.unwrap();
        assert!(matches!(resp, ReplResponse::MetaSync { ok: true }));
        server.stop();
    }

    #[tokio::test]
    async fn test_chips_ride_the_bound_connection() {
        let server = NetworkServer::new();
        server.set_handler(Arc::new(EchoHandler));
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(
            &mut stream,
            &ReplRequest::MetaSync {
                local_ip: "127.0.0.1".into(),
                port: 4321,
            },
        )
        .await
        .unwrap();
        let _: ReplResponse = read_message(&mut stream).await.unwrap();

        // The handshake bound no identity in EchoHandler; bind it manually
        server.update_client_conn_map("10.0.0.2:9221", 1);

        let task = WriteTask::new(
            RmNode::new("10.0.0.2", 9221, PartitionInfo::new("db0", 0)),
            1,
            BinlogChip::new(BinlogOffset::new(0, 5), b"hello".to_vec()),
        );
        server
            .send_slave_binlog_chips("10.0.0.2", 9221, &[task])
            .await
            .unwrap();

        let resp: ReplResponse = read_message(&mut stream).await.unwrap();
        match resp {
            ReplResponse::BinlogChips { tasks } => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].chip.payload, b"hello");
            }
            other => panic!("unexpected push {}", other.type_name()),
        }

        // Unknown identities have nowhere to go
        assert!(server
            .send_slave_binlog_chips("10.9.9.9", 1, &[])
            .await
            .is_err());
        server.stop();
    }
}
