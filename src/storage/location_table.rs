use crate::networking::peer_info::PeerInfo;
use log::{debug, error};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One recorded offer: a peer that reported holding a chunk, together with
/// the link speed it advertised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkLocation {
    pub peer: PeerInfo,
    pub link_speed: u32,
}

///
/// Per-file table of who offered which chunk during the current discovery
/// window. Indexed by chunk id; each slot holds the offering peers with no
/// duplicate peer address. Entries are created by the coordinator when a
/// discovery starts, grown by the datagram service while the offer gate is
/// open, and consumed once by [`LocationTable::select_peers`] after the
/// window closes.
///
/// Every file's entry sits behind its own mutex, created behind the
/// top-level map lock. Offers arriving after the window are dropped at the
/// gate upstream, so selection never races a writer.
///
pub struct LocationTable {
    files: Mutex<HashMap<String, Arc<Mutex<Vec<Vec<ChunkLocation>>>>>>,
}

impl LocationTable {
    pub fn new() -> LocationTable {
        LocationTable {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a fresh entry of `total_chunks` empty candidate lists. A
    /// repeated search for the same file starts over from an empty table.
    pub fn initialize(&self, file_name: &str, total_chunks: u32) {
        let mut files = self.files.lock().unwrap();
        files.insert(
            file_name.to_string(),
            Arc::new(Mutex::new(vec![Vec::new(); total_chunks as usize])),
        );
    }

    fn entry(&self, file_name: &str) -> Option<Arc<Mutex<Vec<Vec<ChunkLocation>>>>> {
        self.files.lock().unwrap().get(file_name).cloned()
    }

    /// Records an offer. In-range chunk ids gain a `(peer, link_speed)`
    /// candidate unless the peer is already listed for that chunk;
    /// out-of-range ids are logged and dropped without failing the rest of
    /// the offer. Offers for files with no initialized entry are ignored.
    pub fn store_offer(
        &self,
        file_name: &str,
        chunk_ids: &[u32],
        peer: PeerInfo,
        link_speed: u32,
    ) {
        let Some(entry) = self.entry(file_name) else {
            debug!("Offer for '{}' without an active search, ignored", file_name);
            return;
        };

        let mut chunks = entry.lock().unwrap();
        for &chunk_id in chunk_ids {
            let Some(candidates) = chunks.get_mut(chunk_id as usize) else {
                error!(
                    "chunk_id {} out of range for file '{}', dropped",
                    chunk_id, file_name
                );
                continue;
            };
            if candidates.iter().any(|c| c.peer == peer) {
                continue;
            }
            candidates.push(ChunkLocation { peer, link_speed });
        }
    }

    /// Assigns every chunk with at least one candidate to exactly one peer
    /// and returns the per-peer download lists.
    ///
    /// Chunks are visited in ascending id order. For each chunk the
    /// candidates are sorted by link speed, descending and stable, and the
    /// one with the fewest chunks assigned so far wins; on equal load the
    /// sort order decides, so the faster peer takes the chunk. Chunks
    /// nobody offered are left out — they are unobtainable in this window.
    ///
    /// A simple greedy: prefer fast suppliers but spread the load so one
    /// fast peer does not serialize the whole download.
    pub fn select_peers(&self, file_name: &str) -> HashMap<PeerInfo, Vec<u32>> {
        let mut assignments: HashMap<PeerInfo, Vec<u32>> = HashMap::new();
        let Some(entry) = self.entry(file_name) else {
            return assignments;
        };

        let chunks = entry.lock().unwrap();
        for (chunk_id, candidates) in chunks.iter().enumerate() {
            if candidates.is_empty() {
                continue;
            }

            let mut by_speed: Vec<&ChunkLocation> = candidates.iter().collect();
            by_speed.sort_by(|a, b| b.link_speed.cmp(&a.link_speed));

            // min_by_key keeps the first minimum, which after the sort is
            // the fastest among the least-loaded candidates.
            let Some(chosen) = by_speed
                .iter()
                .min_by_key(|c| assignments.get(&c.peer).map_or(0, Vec::len))
            else {
                continue;
            };

            assignments
                .entry(chosen.peer)
                .or_default()
                .push(chunk_id as u32);
        }

        assignments
    }
}

impl Default for LocationTable {
    fn default() -> Self {
        LocationTable::new()
    }
}
