use rand::Rng;
use std::path::{Path, PathBuf};

/// Drops a chunk file into a node's directory the way the store lays them
/// out, creating the directory if needed. Returns the chunk path.
pub fn seed_chunk(base: &Path, node_id: u32, file_name: &str, chunk_id: u32, data: &[u8]) -> PathBuf {
    let node_dir = base.join(node_id.to_string());
    std::fs::create_dir_all(&node_dir).unwrap();
    let path = node_dir.join(format!("{}.ch{}", file_name, chunk_id));
    std::fs::write(&path, data).unwrap();
    path
}

/// A payload of random bytes.
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random()).collect()
}
