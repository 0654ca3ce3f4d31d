//! Inspect command implementation.

use evlog_core::block::{parse_block_file_name, Block};
use evlog_core::meta::{keys, BlockMeta, SyncStore, SYNC_STORE_FILE};
use evlog_storage::{FileVolume, Volume};
use serde::Serialize;
use std::path::Path;

/// One block as shown by `inspect`.
#[derive(Debug, Serialize)]
pub struct BlockInfo {
    /// Block id.
    pub id: u64,
    /// Capacity in bytes.
    pub capacity: u64,
    /// Bytes used.
    pub size: u64,
    /// Number of entries.
    pub entries: u64,
    /// Whether the block is archived.
    pub archived: bool,
    /// Store time of the first entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_stime: Option<i64>,
    /// Store time of the last entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stime: Option<i64>,
    /// Raft group members as `id@endpoint`; empty before activation.
    pub peers: Vec<String>,
    /// Whether the sync store knows the block.
    pub has_metadata: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let volume = FileVolume::open_dir(path)?;
    let blocks = collect(&volume)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&blocks)?),
        _ => print_text_output(path, &blocks),
    }
    Ok(())
}

pub(crate) fn collect(volume: &dyn Volume) -> Result<Vec<BlockInfo>, Box<dyn std::error::Error>> {
    if !volume.exists(SYNC_STORE_FILE) {
        return Err("not an evlog volume: metadata store missing".into());
    }
    let store = SyncStore::open(volume.open(SYNC_STORE_FILE)?)?;

    let mut blocks = Vec::new();
    for name in volume.list()? {
        let Some(id) = parse_block_file_name(&name) else {
            continue;
        };
        let stats = Block::open(volume, id)?.statistics();
        let meta: Option<BlockMeta> = store.get(&keys::block_meta(id))?;
        blocks.push(BlockInfo {
            id: id.as_u64(),
            capacity: stats.capacity,
            size: stats.size,
            entries: stats.entry_count,
            archived: stats.archived,
            first_stime: stats.first_entry_stime,
            last_stime: stats.last_entry_stime,
            peers: meta
                .as_ref()
                .map(|m| m.peers.iter().map(|p| format!("{}@{}", p.id, p.endpoint)).collect())
                .unwrap_or_default(),
            has_metadata: meta.is_some(),
        });
    }
    store.close();
    Ok(blocks)
}

fn print_text_output(path: &Path, blocks: &[BlockInfo]) {
    println!("Volume {} ({} blocks)", path.display(), blocks.len());
    println!("================");
    for block in blocks {
        let fill = if block.capacity == 0 {
            0.0
        } else {
            block.size as f64 * 100.0 / block.capacity as f64
        };
        print!(
            "block {:>20}  entries={:<8} size={}/{} ({fill:.1}%)",
            block.id, block.entries, block.size, block.capacity
        );
        if block.archived {
            print!(" archived");
        }
        if !block.has_metadata {
            print!(" orphan");
        }
        println!();
        if !block.peers.is_empty() {
            println!("    peers: {}", block.peers.join(", "));
        }
    }
}
