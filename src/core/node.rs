use crate::config::FileMetadata;
use crate::constants::STREAM_PORT_OFFSET;
use crate::networking::peer_info::PeerInfo;
use crate::networking::tcp_transfer::TransferService;
use crate::networking::udp_service::UdpService;
use crate::storage::chunk_store::ChunkStore;
use crate::storage::location_table::LocationTable;
use anyhow::{Context, Result};
use log::info;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// How a search concluded from the coordinator's point of view. Chunks
/// requested from peers keep arriving in the background afterwards; the
/// store assembles the file on the save that completes the set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchStatus {
    /// Nothing to fetch; the file needs no chunks.
    Complete,
    /// Requests were issued to the selected peers.
    Requested { peers: usize, chunks: usize },
    /// The response window closed without a single usable offer.
    Unavailable,
}

impl Display for SearchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchStatus::Complete => write!(f, "complete"),
            SearchStatus::Requested { peers, chunks } => {
                write!(f, "{} chunks requested from {} peers", chunks, peers)
            }
            SearchStatus::Unavailable => write!(f, "no chunks obtainable in this window"),
        }
    }
}

///
/// A Node ties the four other components together: it owns the chunk store,
/// the location table and both transport services, and it drives the
/// acquisition pipeline for each search.
///
pub struct Node {
    pub id: u32,
    store: Arc<ChunkStore>,
    locations: Arc<LocationTable>,
    udp: Arc<UdpService>,
    transfers: Arc<TransferService>,
}

impl Node {
    /// Builds a node listening at `address`. The datagram socket is bound
    /// first so the stream listener can sit at the actually-bound udp port
    /// plus the fixed offset — which is also how peers will derive it.
    pub async fn new(
        id: u32,
        address: SocketAddr,
        link_speed: u32,
        base_dir: &Path,
    ) -> Result<Node> {
        let store = Arc::new(ChunkStore::new(base_dir, id));
        store
            .load_local()
            .await
            .with_context(|| format!("failed to index chunk directory for node {}", id))?;
        let locations = Arc::new(LocationTable::new());

        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("failed to bind datagram socket on {}", address))?;
        let udp_port = socket.local_addr()?.port();
        let local_peer = PeerInfo::new(SocketAddr::new(address.ip(), udp_port));

        let stream_address =
            SocketAddr::new(address.ip(), udp_port.wrapping_add(STREAM_PORT_OFFSET));
        let transfers = Arc::new(TransferService::bind(
            stream_address,
            link_speed,
            Arc::clone(&store),
        )?);

        let udp = Arc::new(UdpService::new(
            socket,
            local_peer,
            link_speed,
            Arc::clone(&store),
            Arc::clone(&locations),
            Arc::clone(&transfers),
        ));

        Ok(Node {
            id,
            store,
            locations,
            udp,
            transfers,
        })
    }

    pub fn local_peer(&self) -> PeerInfo {
        self.udp.local_peer()
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn set_neighbors(&self, neighbors: Vec<PeerInfo>) {
        self.udp.set_neighbors(neighbors);
    }

    /// Spawns the stream accept loop and the datagram receive loop.
    pub fn start_listening(&self) {
        Arc::clone(&self.transfers).run();
        Arc::clone(&self.udp).run();
        info!("Node {} listening as {}", self.id, self.local_peer());
    }

    /// Runs one acquisition: flood a discovery, sit out the response
    /// window, assign chunks to the peers that offered them, and request
    /// each peer's share. Transfers then arrive in the background and the
    /// file is assembled by the save that completes the set.
    pub async fn search(&self, metadata: &FileMetadata) -> SearchStatus {
        let file_name = &metadata.file_name;
        info!(
            "Searching for '{}' ({} chunks, ttl {})",
            file_name, metadata.total_chunks, metadata.initial_ttl
        );

        if metadata.total_chunks == 0 {
            info!("'{}' has no chunks, nothing to acquire", file_name);
            return SearchStatus::Complete;
        }

        self.locations.initialize(file_name, metadata.total_chunks);
        self.store
            .register_assembly(file_name, metadata.total_chunks);

        let window = self
            .udp
            .start_discovery(file_name, metadata.total_chunks, metadata.initial_ttl)
            .await;
        // The timer closes the offer gate before this returns, so selection
        // below never races an incoming offer.
        let _ = window.await;

        let assignments = self.locations.select_peers(file_name);
        if assignments.is_empty() {
            info!("No peer offered chunks of '{}' in this window", file_name);
            return SearchStatus::Unavailable;
        }

        let chunks = assignments.values().map(Vec::len).sum();
        self.udp.send_request(file_name, &assignments).await;
        SearchStatus::Requested {
            peers: assignments.len(),
            chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_stream_listener_sits_at_derived_port() {
        let dir = tempdir().unwrap();
        let node = Node::new(1, "127.0.0.1:0".parse().unwrap(), 1000, dir.path())
            .await
            .unwrap();

        let udp_port = node.local_peer().address.port();
        let stream_port = node.transfers.local_addr().unwrap().port();
        assert_eq!(stream_port, udp_port + STREAM_PORT_OFFSET);
    }

    #[tokio::test]
    async fn test_search_with_zero_chunks_completes_immediately() {
        let dir = tempdir().unwrap();
        let node = Node::new(1, "127.0.0.1:0".parse().unwrap(), 1000, dir.path())
            .await
            .unwrap();

        let metadata = FileMetadata {
            file_name: "empty.bin".to_string(),
            total_chunks: 0,
            initial_ttl: 3,
        };
        let status = node.search(&metadata).await;
        assert_eq!(status, SearchStatus::Complete);
        assert!(node.store().available_chunks("empty.bin").is_empty());
    }

    #[tokio::test]
    async fn test_startup_indexes_existing_chunks() {
        let dir = tempdir().unwrap();
        crate::utils::testing::seed_chunk(dir.path(), 3, "f.bin", 0, b"x");
        crate::utils::testing::seed_chunk(dir.path(), 3, "f.bin", 1, b"y");

        let node = Node::new(3, "127.0.0.1:0".parse().unwrap(), 1000, dir.path())
            .await
            .unwrap();
        assert_eq!(node.store().available_chunks("f.bin"), vec![0, 1]);
    }
}
