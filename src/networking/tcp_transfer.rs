use crate::constants::{
    CONTROL_MESSAGE_SIZE, PACING_INTERVAL_SECONDS, RESPONSE_TIMEOUT_SECONDS,
    TCP_MAX_PENDING_CONNECTIONS,
};
use crate::networking::messages::ControlHeader;
use crate::storage::chunk_store::ChunkStore;
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(RESPONSE_TIMEOUT_SECONDS);

///
/// The TransferService is the reliable side of the node: it accepts inbound
/// stream connections carrying chunks and writes them into the ChunkStore,
/// and it opens outbound connections to deliver requested chunks.
///
/// Every chunk on the wire is a fixed 1024-byte control record followed by
/// exactly the payload length the record announces. One connection may
/// carry any number of such pairs in sequence. This service is the only
/// path by which remote chunks enter the store.
///
pub struct TransferService {
    listener: TcpListener,
    link_speed: u32,
    store: Arc<ChunkStore>,
}

impl TransferService {
    /// Binds the stream listener with the fixed backlog. The address is the
    /// node's stream address: its ip at udp_port + 1000.
    pub fn bind(
        address: SocketAddr,
        link_speed: u32,
        store: Arc<ChunkStore>,
    ) -> Result<TransferService> {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create stream socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(address)
            .with_context(|| format!("failed to bind stream listener on {}", address))?;
        let listener = socket
            .listen(TCP_MAX_PENDING_CONNECTIONS)
            .context("failed to listen on stream socket")?;

        Ok(TransferService {
            listener,
            link_speed,
            store,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each accepted connection gets its own task.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                target: "transfer",
                "Stream listener running on {}",
                self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
            );
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move {
                            service.receive_chunks(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!(target: "transfer", "Failed to accept stream connection: {}", e);
                    }
                }
            }
        })
    }

    /// Reads (control record, payload) pairs until the peer closes or a
    /// read times out. A chunk that fails to persist locally is skipped
    /// without dropping the connection; a short or timed-out record ends
    /// the connection and discards the partial chunk.
    async fn receive_chunks(&self, mut stream: TcpStream, peer: SocketAddr) {
        loop {
            let mut record = [0u8; CONTROL_MESSAGE_SIZE];
            let mut filled = 0;
            while filled < CONTROL_MESSAGE_SIZE {
                match timeout(RECEIVE_TIMEOUT, stream.read(&mut record[filled..])).await {
                    Ok(Ok(0)) => {
                        if filled == 0 {
                            info!(target: "transfer", "Connection from {} closed", peer);
                        } else {
                            warn!(
                                target: "transfer",
                                "{} closed mid control record ({}/{} bytes)",
                                peer, filled, CONTROL_MESSAGE_SIZE
                            );
                        }
                        return;
                    }
                    Ok(Ok(n)) => filled += n,
                    Ok(Err(e)) => {
                        error!(target: "transfer", "Error reading control record from {}: {}", peer, e);
                        return;
                    }
                    Err(_) => {
                        warn!(target: "transfer", "Timeout waiting for control record from {}", peer);
                        return;
                    }
                }
            }

            let header = match ControlHeader::decode(&record) {
                Ok(header) => header,
                Err(e) => {
                    error!(target: "transfer", "Bad control record from {}: {}", peer, e);
                    return;
                }
            };
            info!(target: "transfer", "{} from {}", header, peer);

            let Some(data) = self.receive_payload(&mut stream, &header, peer).await else {
                return;
            };

            match self
                .store
                .save_chunk(&header.file_name, header.chunk_id, &data)
                .await
            {
                Ok(()) => {
                    info!(
                        target: "transfer",
                        "Stored chunk {} of '{}' ({} bytes) from {}",
                        header.chunk_id, header.file_name, data.len(), peer
                    );
                    self.store.try_assemble(&header.file_name).await;
                }
                Err(e) => {
                    // The transfer itself succeeded; only this chunk is lost.
                    error!(
                        target: "transfer",
                        "Failed to persist chunk {} of '{}': {}",
                        header.chunk_id, header.file_name, e
                    );
                }
            }
        }
    }

    /// Reads exactly `chunk_size` payload bytes, in blocks sized by the
    /// sender's reported link speed. None means the connection is done for:
    /// the partial chunk is discarded and never reaches the store.
    async fn receive_payload(
        &self,
        stream: &mut TcpStream,
        header: &ControlHeader,
        peer: SocketAddr,
    ) -> Option<Vec<u8>> {
        let total = header.chunk_size as usize;
        let block = (header.link_speed as usize).max(1);
        let mut data = vec![0u8; total];
        let mut received = 0;

        while received < total {
            let want = block.min(total - received);
            match timeout(RECEIVE_TIMEOUT, stream.read(&mut data[received..received + want])).await
            {
                Ok(Ok(0)) => {
                    warn!(
                        target: "transfer",
                        "Short receive of chunk {} from {}: {}/{} bytes",
                        header.chunk_id, peer, received, total
                    );
                    return None;
                }
                Ok(Ok(n)) => received += n,
                Ok(Err(e)) => {
                    error!(target: "transfer", "Error receiving chunk {} from {}: {}", header.chunk_id, peer, e);
                    return None;
                }
                Err(_) => {
                    warn!(
                        target: "transfer",
                        "Timeout receiving chunk {} from {} at {}/{} bytes",
                        header.chunk_id, peer, received, total
                    );
                    return None;
                }
            }
        }

        Some(data)
    }

    /// Delivers a batch of chunks over one outbound connection. A chunk
    /// file that cannot be read is skipped; a socket error abandons the
    /// rest of the batch since the stream position is unknown.
    pub async fn send_chunks(&self, file_name: &str, chunk_ids: &[u32], dest: SocketAddr) {
        let mut stream = match TcpStream::connect(dest).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(target: "transfer", "Failed to connect to {}: {}", dest, e);
                return;
            }
        };
        info!(
            target: "transfer",
            "Sending {} chunks of '{}' to {}",
            chunk_ids.len(), file_name, dest
        );

        for &chunk_id in chunk_ids {
            if let Err(e) = self.send_one(&mut stream, file_name, chunk_id).await {
                error!(
                    target: "transfer",
                    "Transfer of chunk {} of '{}' to {} failed: {:#}",
                    chunk_id, file_name, dest, e
                );
                return;
            }
        }
    }

    async fn send_one(&self, stream: &mut TcpStream, file_name: &str, chunk_id: u32) -> Result<()> {
        let path = self.store.chunk_path(file_name, chunk_id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                error!(
                    target: "transfer",
                    "Chunk {} of '{}' not readable, skipped: {}",
                    chunk_id, file_name, e
                );
                return Ok(());
            }
        };

        let header = ControlHeader {
            file_name: file_name.to_string(),
            chunk_id,
            link_speed: self.link_speed,
            chunk_size: data.len() as u64,
        };
        let record = header.encode().context("control record encoding")?;
        stream
            .write_all(&record)
            .await
            .context("sending control record")?;

        // Payload goes out in slices of the local link speed with a pause
        // between slices. This is the bandwidth simulation; receivers do
        // not pace.
        let slice_size = (self.link_speed as usize).max(1);
        let mut sent = 0;
        let mut slices = data.chunks(slice_size).peekable();
        while let Some(slice) = slices.next() {
            stream.write_all(slice).await.context("sending payload")?;
            sent += slice.len();
            info!(
                target: "transfer",
                "Sent {} bytes of chunk {} of '{}' ({}/{})",
                slice.len(), chunk_id, file_name, sent, data.len()
            );
            if slices.peek().is_some() {
                sleep(Duration::from_secs(PACING_INTERVAL_SECONDS)).await;
            }
        }

        info!(
            target: "transfer",
            "Chunk {} of '{}' delivered ({} bytes)",
            chunk_id, file_name, data.len()
        );
        Ok(())
    }
}
