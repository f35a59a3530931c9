use clap::Parser;

#[derive(Parser, Debug)]
#[clap(name = "chunknet", version = "0.1.0")]
/// Peer-to-peer chunked file distribution node
pub struct Arguments {
    /// Id of this node in the registry and topology files.
    pub node_id: u32,

    #[arg(long, default_value = "config.txt")]
    /// Node registry: one `<id>:<ip>,<udp_port>,<link_speed>` per line.
    pub config: String,

    #[arg(long, default_value = "topology.txt")]
    /// Topology: one `<id>:<neighbor_id>,<neighbor_id>,...` per line.
    pub topology: String,

    #[arg(long, default_value = "data")]
    /// Base directory; this node stores chunks under `<base>/<node_id>/`.
    pub base_dir: String,

    #[arg(short, long)]
    /// Log the ongoing communication to stdout. (For debugging purposes).
    pub verbose: bool,
}
