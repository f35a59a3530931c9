//! Multi-node acquisition scenarios over real sockets. Each node gets its
//! own loopback address so the source addresses peers see match the
//! configured ones and the orig-ip loop suppression stays meaningful.

use chunknet::config::FileMetadata;
use chunknet::core::node::{Node, SearchStatus};
use chunknet::networking::messages::ControlHeader;
use chunknet::networking::tcp_transfer::TransferService;
use chunknet::storage::chunk_store::ChunkStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::sleep;

fn seed_chunk(base: &Path, node_id: u32, file_name: &str, chunk_id: u32, data: &[u8]) {
    let node_dir = base.join(node_id.to_string());
    std::fs::create_dir_all(&node_dir).unwrap();
    std::fs::write(node_dir.join(format!("{}.ch{}", file_name, chunk_id)), data).unwrap();
}

async fn node(id: u32, ip: &str, link_speed: u32, base: &Path) -> Node {
    let node = Node::new(id, format!("{}:0", ip).parse().unwrap(), link_speed, base)
        .await
        .unwrap();
    node.start_listening();
    node
}

async fn wait_for_path(path: &Path, seconds: u64) -> bool {
    for _ in 0..seconds * 10 {
        if path.exists() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// A line topology A-B-C where only C holds the file. A's discovery has to
/// travel through B, C's offer comes back directly, and both chunks flow
/// from C to A over the stream transport.
#[tokio::test(flavor = "multi_thread")]
async fn test_acquisition_across_line_topology() {
    let base = tempdir().unwrap();
    seed_chunk(base.path(), 3, "f.bin", 0, b"alpha-");
    seed_chunk(base.path(), 3, "f.bin", 1, b"omega");

    let a = node(1, "127.0.0.1", 4096, base.path()).await;
    let b = node(2, "127.0.0.2", 4096, base.path()).await;
    let c = node(3, "127.0.0.3", 4096, base.path()).await;

    a.set_neighbors(vec![b.local_peer()]);
    b.set_neighbors(vec![a.local_peer(), c.local_peer()]);
    c.set_neighbors(vec![b.local_peer()]);

    let metadata = FileMetadata {
        file_name: "f.bin".to_string(),
        total_chunks: 2,
        initial_ttl: 2,
    };
    let status = a.search(&metadata).await;
    assert_eq!(
        status,
        SearchStatus::Requested {
            peers: 1,
            chunks: 2
        }
    );

    let assembled = a.store().assembled_path("f.bin");
    assert!(wait_for_path(&assembled, 10).await, "file never assembled");
    assert_eq!(std::fs::read(&assembled).unwrap(), b"alpha-omega");
    assert!(a.store().has_all("f.bin", 2));
}

/// The only supplier holds chunks {0, 2} of four. The requester fetches
/// exactly those, the set stays incomplete and no assembled file appears.
#[tokio::test(flavor = "multi_thread")]
async fn test_partial_holdings_leave_file_incomplete() {
    let base = tempdir().unwrap();
    seed_chunk(base.path(), 2, "f.bin", 0, b"zero");
    seed_chunk(base.path(), 2, "f.bin", 2, b"two");

    let a = node(1, "127.0.0.1", 4096, base.path()).await;
    let b = node(2, "127.0.0.2", 4096, base.path()).await;
    a.set_neighbors(vec![b.local_peer()]);
    b.set_neighbors(vec![a.local_peer()]);

    let metadata = FileMetadata {
        file_name: "f.bin".to_string(),
        total_chunks: 4,
        initial_ttl: 1,
    };
    let status = a.search(&metadata).await;
    assert_eq!(
        status,
        SearchStatus::Requested {
            peers: 1,
            chunks: 2
        }
    );

    // Give the two small transfers ample time, then check nothing more
    // ever arrived.
    for _ in 0..50 {
        if a.store().available_chunks("f.bin").len() == 2 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(a.store().available_chunks("f.bin"), vec![0, 2]);
    assert!(!a.store().has_all("f.bin", 4));
    assert!(!a.store().assembled_path("f.bin").exists());
}

/// A search in a network where nobody holds the file ends unavailable and
/// leaves no local state behind.
#[tokio::test(flavor = "multi_thread")]
async fn test_search_with_no_suppliers_is_unavailable() {
    let base = tempdir().unwrap();

    let a = node(1, "127.0.0.1", 4096, base.path()).await;
    let b = node(2, "127.0.0.2", 4096, base.path()).await;
    a.set_neighbors(vec![b.local_peer()]);
    b.set_neighbors(vec![a.local_peer()]);

    let metadata = FileMetadata {
        file_name: "ghost.bin".to_string(),
        total_chunks: 3,
        initial_ttl: 1,
    };
    let status = a.search(&metadata).await;
    assert_eq!(status, SearchStatus::Unavailable);
    assert!(a.store().available_chunks("ghost.bin").is_empty());
}

/// A multi-megabyte chunk delivered in 1024-byte segments lands on disk
/// with exactly the announced size.
#[tokio::test(flavor = "multi_thread")]
async fn test_large_chunk_in_small_segments() {
    let base = tempdir().unwrap();
    let store = Arc::new(ChunkStore::new(base.path(), 1));
    store.load_local().await.unwrap();
    let service = Arc::new(
        TransferService::bind("127.0.0.1:0".parse().unwrap(), 1 << 20, Arc::clone(&store))
            .unwrap(),
    );
    let addr = service.local_addr().unwrap();
    service.run();

    let chunk_size: usize = 5_242_880;
    let header = ControlHeader {
        file_name: "big.bin".to_string(),
        chunk_id: 0,
        link_speed: 1 << 20,
        chunk_size: chunk_size as u64,
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&header.encode().unwrap()).await.unwrap();
    let segment = [0x5au8; 1024];
    let mut sent = 0;
    while sent < chunk_size {
        let n = segment.len().min(chunk_size - sent);
        client.write_all(&segment[..n]).await.unwrap();
        sent += n;
    }
    client.flush().await.unwrap();

    let chunk_path = store.chunk_path("big.bin", 0);
    assert!(wait_for_path(&chunk_path, 20).await, "chunk never stored");
    for _ in 0..100 {
        if store.has_chunk("big.bin", 0) {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(store.has_chunk("big.bin", 0));
    assert_eq!(
        std::fs::metadata(&chunk_path).unwrap().len(),
        chunk_size as u64
    );
}

/// One chunk transfers fine, then the sender stalls in the middle of the
/// next control record past the receive timeout. The first chunk stays,
/// the second never appears, and the listener remains healthy.
#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_record_discards_only_the_pending_chunk() {
    let base = tempdir().unwrap();
    let store = Arc::new(ChunkStore::new(base.path(), 1));
    store.load_local().await.unwrap();
    let service = Arc::new(
        TransferService::bind("127.0.0.1:0".parse().unwrap(), 4096, Arc::clone(&store)).unwrap(),
    );
    let addr = service.local_addr().unwrap();
    service.run();

    let header = ControlHeader {
        file_name: "f.bin".to_string(),
        chunk_id: 0,
        link_speed: 4096,
        chunk_size: 20,
    };
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&header.encode().unwrap()).await.unwrap();
    client.write_all(&[9u8; 20]).await.unwrap();

    // Half a control record, then silence until past the timeout.
    client.write_all(&[1u8; 100]).await.unwrap();
    sleep(Duration::from_secs(11)).await;

    assert_eq!(store.available_chunks("f.bin"), vec![0]);

    // The accept loop still serves fresh connections afterwards.
    let follow_up = ControlHeader {
        file_name: "f.bin".to_string(),
        chunk_id: 1,
        link_speed: 4096,
        chunk_size: 4,
    };
    let mut second = TcpStream::connect(addr).await.unwrap();
    second
        .write_all(&follow_up.encode().unwrap())
        .await
        .unwrap();
    second.write_all(b"done").await.unwrap();

    for _ in 0..50 {
        if store.has_chunk("f.bin", 1) {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(store.available_chunks("f.bin"), vec![0, 1]);
}
