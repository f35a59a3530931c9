mod cli;

use chunknet::config::{FileMetadata, NodeRegistry, Topology};
use chunknet::core::node::Node;
use chunknet::utils::logging::init_logging;
use clap::Parser;
use cli::args::Arguments;
use log::{error, info, LevelFilter};
use std::path::Path;
use tokio::io::{self, AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments; a missing or malformed node id exits 1.
    let args = match Arguments::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    // Initialize logging based on verbosity
    if args.verbose {
        init_logging(LevelFilter::Info);
    } else {
        init_logging(LevelFilter::Warn);
    }

    // Load the node registry and the topology
    let registry = NodeRegistry::parse_from_file(Path::new(&args.config)).map_err(|e| {
        error!("Failed to read node registry '{}': {}", args.config, e);
        e
    })?;
    let topology = Topology::parse_from_file(Path::new(&args.topology)).map_err(|e| {
        error!("Failed to read topology '{}': {}", args.topology, e);
        e
    })?;

    // The node must exist in both files
    let Some(entry) = registry.get(args.node_id) else {
        error!("Node {} not found in '{}'", args.node_id, args.config);
        std::process::exit(1);
    };
    let Some(neighbor_ids) = topology.neighbors_of(args.node_id) else {
        error!("Node {} not found in '{}'", args.node_id, args.topology);
        std::process::exit(1);
    };
    let neighbors = registry.resolve_peers(neighbor_ids);

    // Create the node and begin listening on both transports
    let node = Node::new(
        entry.id,
        entry.address,
        entry.link_speed,
        Path::new(&args.base_dir),
    )
    .await
    .map_err(|e| {
        error!("Failed to create node {}: {}", args.node_id, e);
        e
    })?;
    node.set_neighbors(neighbors);
    node.start_listening();

    // Exit cleanly on Ctrl+C.
    tokio::spawn(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received shutdown signal");
        std::process::exit(0);
    });

    println!("──────────────────────────────── ✧ ✧ ✧ ────────────────────────────────");
    println!(
        "Node {} is up as {} (stream port {})",
        node.id,
        node.local_peer(),
        node.local_peer().stream_address().port()
    );
    println!("Available commands:");
    println!(" - search <metadata_file>: Acquire the file described by the metadata file");
    println!(" - chunks <file_name>: List the chunks of <file_name> held locally");
    println!(" - quit: Shut the node down");
    println!("──────────────────────────────── ✧ ✧ ✧ ────────────────────────────────");

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "search" if parts.len() == 2 => match FileMetadata::load(Path::new(parts[1])) {
                Ok(metadata) => {
                    println!(
                        "Searching for '{}' ({} chunks, ttl {})...",
                        metadata.file_name, metadata.total_chunks, metadata.initial_ttl
                    );
                    let status = node.search(&metadata).await;
                    println!("Search for '{}': {}", metadata.file_name, status);
                }
                Err(e) => eprintln!("Invalid metadata file: {}", e),
            },
            "chunks" if parts.len() == 2 => {
                let available = node.store().available_chunks(parts[1]);
                if available.is_empty() {
                    println!("No chunks of '{}' held locally", parts[1]);
                } else {
                    println!("Chunks of '{}': {:?}", parts[1], available);
                }
            }
            "quit" | "exit" if parts.len() == 1 => break,
            _ => {
                eprintln!(
                    "Wrong command or syntax '{}'. Valid commands are: 'search <metadata_file>', 'chunks <file_name>' or 'quit'",
                    parts[0]
                );
            }
        }
        println!("──────────────────────────────── ✧ ✧ ✧ ────────────────────────────────");
    }

    Ok(())
}
