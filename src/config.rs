use crate::networking::peer_info::PeerInfo;
use log::{error, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;

/// Errors for the flat configuration files. Malformed individual lines are
/// not errors — they are logged and skipped — so these only cover files
/// that cannot be used at all.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata file '{path}' is missing its {field} line")]
    MissingMetadataLine { path: String, field: &'static str },
    #[error("metadata file '{path}': bad {field} '{value}'")]
    BadMetadataLine {
        path: String,
        field: &'static str,
        value: String,
    },
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// One line of the node registry: `<id>:<ip>,<udp_port>,<link_speed>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: u32,
    pub address: SocketAddr,
    pub link_speed: u32,
}

impl NodeEntry {
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.address)
    }
}

///
/// The node registry maps every node id in the network to its address and
/// link speed. Lines are parsed independently; a malformed line is logged
/// and skipped.
///
pub struct NodeRegistry {
    nodes: HashMap<u32, NodeEntry>,
}

impl NodeRegistry {
    pub fn parse_from_file(path: &Path) -> Result<NodeRegistry, ConfigError> {
        let content = read_file(path)?;
        let mut nodes = HashMap::new();

        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_node_line(line) {
                Some(entry) => {
                    nodes.insert(entry.id, entry);
                }
                None => error!(
                    "Malformed node line {} in '{}', skipped: '{}'",
                    number + 1,
                    path.display(),
                    line
                ),
            }
        }

        Ok(NodeRegistry { nodes })
    }

    pub fn get(&self, id: u32) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    /// Resolves neighbor ids to peer addresses, dropping ids the registry
    /// does not know about.
    pub fn resolve_peers(&self, neighbor_ids: &[u32]) -> Vec<PeerInfo> {
        neighbor_ids
            .iter()
            .filter_map(|id| match self.nodes.get(id) {
                Some(entry) => Some(entry.peer_info()),
                None => {
                    warn!("Neighbor id {} not in the node registry, dropped", id);
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn parse_node_line(line: &str) -> Option<NodeEntry> {
    let (id, rest) = line.split_once(':')?;
    let id = id.trim().parse::<u32>().ok()?;

    let mut fields = rest.split(',');
    let ip = fields.next()?.trim().parse::<IpAddr>().ok()?;
    let udp_port = fields.next()?.trim().parse::<u16>().ok()?;
    let link_speed = fields.next()?.trim().parse::<u32>().ok()?;
    if fields.next().is_some() {
        return None;
    }

    Some(NodeEntry {
        id,
        address: SocketAddr::new(ip, udp_port),
        link_speed,
    })
}

///
/// The static topology: which node ids are direct neighbors of which. One
/// line per node, `<id>:<id>,<id>,...`; malformed lines are logged and
/// skipped.
///
pub struct Topology {
    neighbors: HashMap<u32, Vec<u32>>,
}

impl Topology {
    pub fn parse_from_file(path: &Path) -> Result<Topology, ConfigError> {
        let content = read_file(path)?;
        let mut neighbors = HashMap::new();

        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_topology_line(line) {
                Some((id, ids)) => {
                    neighbors.insert(id, ids);
                }
                None => error!(
                    "Malformed topology line {} in '{}', skipped: '{}'",
                    number + 1,
                    path.display(),
                    line
                ),
            }
        }

        Ok(Topology { neighbors })
    }

    pub fn neighbors_of(&self, id: u32) -> Option<&[u32]> {
        self.neighbors.get(&id).map(Vec::as_slice)
    }
}

fn parse_topology_line(line: &str) -> Option<(u32, Vec<u32>)> {
    let (id, rest) = line.split_once(':')?;
    let id = id.trim().parse::<u32>().ok()?;
    let ids = rest
        .split(',')
        .map(|field| field.trim().parse::<u32>())
        .collect::<Result<Vec<u32>, _>>()
        .ok()?;
    Some((id, ids))
}

///
/// Descriptor of a file a node wants to acquire: three lines holding the
/// file name, the total chunk count and the initial flood TTL.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_name: String,
    pub total_chunks: u32,
    pub initial_ttl: u32,
}

impl FileMetadata {
    pub fn load(path: &Path) -> Result<FileMetadata, ConfigError> {
        let content = read_file(path)?;
        let mut lines = content.lines();

        let file_name = lines
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ConfigError::MissingMetadataLine {
                path: path.display().to_string(),
                field: "file_name",
            })?
            .to_string();
        let total_chunks = parse_metadata_number(path, &mut lines, "total_chunks")?;
        let initial_ttl = parse_metadata_number(path, &mut lines, "initial_ttl")?;

        Ok(FileMetadata {
            file_name,
            total_chunks,
            initial_ttl,
        })
    }
}

fn parse_metadata_number<'a>(
    path: &Path,
    lines: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<u32, ConfigError> {
    let line = lines
        .next()
        .ok_or_else(|| ConfigError::MissingMetadataLine {
            path: path.display().to_string(),
            field,
        })?;
    line.trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::BadMetadataLine {
            path: path.display().to_string(),
            field,
            value: line.trim().to_string(),
        })
}
