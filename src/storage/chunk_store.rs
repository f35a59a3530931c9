use log::{error, info};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// File name suffix separating the base file name from the chunk id.
const CHUNK_SUFFIX: &str = ".ch";

struct AssemblyTarget {
    total_chunks: u32,
    completed: bool,
}

///
/// The ChunkStore owns the node's on-disk chunk directory and the in-memory
/// index of which chunks are held locally. Chunks live as individual files
/// named `<file_name>.ch<chunk_id>`; the assembled file, once complete, sits
/// next to them as `<file_name>`.
///
/// The disk is the source of truth. The index is a cache rebuilt by
/// [`ChunkStore::load_local`] at startup and updated on every successful
/// save. Each file's chunk set sits behind its own mutex, created on first
/// access behind the top-level map lock; none of the locks is ever held
/// across an await point.
///
pub struct ChunkStore {
    directory: PathBuf,
    local_chunks: Mutex<HashMap<String, Arc<Mutex<BTreeSet<u32>>>>>,
    assemblies: Mutex<HashMap<String, AssemblyTarget>>,
}

impl ChunkStore {
    pub fn new(base_dir: &Path, node_id: u32) -> ChunkStore {
        ChunkStore {
            directory: base_dir.join(node_id.to_string()),
            local_chunks: Mutex::new(HashMap::new()),
            assemblies: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The chunk set of one file, created on first access behind the
    /// top-level map lock.
    fn per_file_set(&self, file_name: &str) -> Arc<Mutex<BTreeSet<u32>>> {
        let mut local_chunks = self.local_chunks.lock().unwrap();
        local_chunks
            .entry(file_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BTreeSet::new())))
            .clone()
    }

    /// Scans the chunk directory and rebuilds the in-memory index. Creates
    /// the directory if it does not exist yet. File names that do not parse
    /// as `<name>.ch<k>` are ignored. Returns the number of chunks indexed.
    pub async fn load_local(&self) -> io::Result<usize> {
        fs::create_dir_all(&self.directory).await?;

        let mut indexed = 0;
        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some((base, chunk_id)) = parse_chunk_file_name(name) {
                self.per_file_set(base).lock().unwrap().insert(chunk_id);
                indexed += 1;
            }
        }

        info!(
            "Indexed {} local chunks under {}",
            indexed,
            self.directory.display()
        );
        Ok(indexed)
    }

    pub fn has_chunk(&self, file_name: &str, chunk_id: u32) -> bool {
        self.per_file_set(file_name)
            .lock()
            .unwrap()
            .contains(&chunk_id)
    }

    /// Writes the chunk to disk, then records it in the index. The index is
    /// only touched after the write succeeded, so a failed write leaves the
    /// chunk set exactly as it was. Overwriting an already held chunk is
    /// idempotent.
    pub async fn save_chunk(&self, file_name: &str, chunk_id: u32, data: &[u8]) -> io::Result<()> {
        fs::write(self.chunk_path(file_name, chunk_id), data).await?;
        self.per_file_set(file_name).lock().unwrap().insert(chunk_id);
        Ok(())
    }

    /// Snapshot of the chunk ids held for `file_name`, in ascending order.
    pub fn available_chunks(&self, file_name: &str) -> Vec<u32> {
        self.per_file_set(file_name)
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }

    pub fn has_all(&self, file_name: &str, total_chunks: u32) -> bool {
        self.per_file_set(file_name).lock().unwrap().len() == total_chunks as usize
    }

    pub fn chunk_path(&self, file_name: &str, chunk_id: u32) -> PathBuf {
        self.directory
            .join(format!("{}{}{}", file_name, CHUNK_SUFFIX, chunk_id))
    }

    pub fn assembled_path(&self, file_name: &str) -> PathBuf {
        self.directory.join(file_name)
    }

    /// Concatenates chunks `0..total_chunks` byte-for-byte into the
    /// assembled file. Returns false without touching anything when chunks
    /// are missing; returns false mid-way when a chunk file cannot be read,
    /// in which case the partial output must not be considered complete.
    pub async fn assemble(&self, file_name: &str, total_chunks: u32) -> bool {
        if !self.has_all(file_name, total_chunks) {
            return false;
        }

        let output_path = self.assembled_path(file_name);
        let mut output = match File::create(&output_path).await {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to create assembled file '{}': {}", file_name, e);
                return false;
            }
        };

        for chunk_id in 0..total_chunks {
            let chunk_path = self.chunk_path(file_name, chunk_id);
            let data = match fs::read(&chunk_path).await {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to open chunk {}: {}", chunk_path.display(), e);
                    return false;
                }
            };
            if let Err(e) = output.write_all(&data).await {
                error!("Failed to write assembled file '{}': {}", file_name, e);
                return false;
            }
        }

        if let Err(e) = output.flush().await {
            error!("Failed to flush assembled file '{}': {}", file_name, e);
            return false;
        }

        info!("File '{}' assembled successfully", file_name);
        true
    }

    /// Registers `file_name` as an assembly target so that
    /// [`ChunkStore::try_assemble`] can fire once the last chunk lands.
    pub fn register_assembly(&self, file_name: &str, total_chunks: u32) {
        let mut assemblies = self.assemblies.lock().unwrap();
        assemblies.insert(
            file_name.to_string(),
            AssemblyTarget {
                total_chunks,
                completed: false,
            },
        );
    }

    /// Assembles `file_name` if it is a registered target with every chunk
    /// present. Called after each successful save; the completion flag
    /// guarantees the assembly runs at most once per registration.
    pub async fn try_assemble(&self, file_name: &str) -> bool {
        let total_chunks = {
            let assemblies = self.assemblies.lock().unwrap();
            match assemblies.get(file_name) {
                Some(target) if !target.completed => target.total_chunks,
                _ => return false,
            }
        };

        if !self.has_all(file_name, total_chunks) {
            return false;
        }

        {
            let mut assemblies = self.assemblies.lock().unwrap();
            match assemblies.get_mut(file_name) {
                Some(target) if !target.completed => target.completed = true,
                _ => return false,
            }
        }

        self.assemble(file_name, total_chunks).await
    }
}

/// Splits a directory entry name of the form `<name>.ch<k>` into its parts.
/// Anything else, including the assembled file itself, yields None.
fn parse_chunk_file_name(name: &str) -> Option<(&str, u32)> {
    let pos = name.rfind(CHUNK_SUFFIX)?;
    let base = &name[..pos];
    if base.is_empty() {
        return None;
    }
    let chunk_id = name[pos + CHUNK_SUFFIX.len()..].parse::<u32>().ok()?;
    Some((base, chunk_id))
}
