//! Dump-wal command implementation.

use evlog_core::raft::Command;
use evlog_core::wal::WalIterator;
use evlog_core::WAL_FILE;
use evlog_storage::{FileVolume, StorageBackend, Volume};
use serde::Serialize;
use std::path::Path;

/// WAL record representation for output.
#[derive(Debug, Serialize)]
pub struct WalRecordInfo {
    /// Offset in the WAL.
    pub offset: u64,
    /// Owning block.
    pub block: u64,
    /// Raft term.
    pub term: u64,
    /// Raft log index.
    pub index: u64,
    /// `noop`, `append` or `undecodable`.
    pub command: &'static str,
    /// Entries carried by an append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<usize>,
    /// Store time proposed for an append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stime: Option<i64>,
}

/// Runs the dump-wal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    block: Option<u64>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let volume = FileVolume::open_dir(path)?;
    if !volume.exists(WAL_FILE) {
        return Err("WAL file not found".into());
    }
    let backend = volume.open(WAL_FILE)?;
    let records = read_records(backend.as_ref(), limit, block)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => print_text_output(&records),
    }
    Ok(())
}

pub(crate) fn read_records(
    backend: &dyn StorageBackend,
    limit: Option<usize>,
    block: Option<u64>,
) -> Result<Vec<WalRecordInfo>, Box<dyn std::error::Error>> {
    let max_records = limit.unwrap_or(usize::MAX);
    let mut records = Vec::new();

    for item in WalIterator::new(backend)? {
        if records.len() >= max_records {
            break;
        }
        let (offset, record) = item?;
        if block.is_some_and(|b| b != record.block.as_u64()) {
            continue;
        }
        let (command, entries, stime) = match Command::decode(&record.data) {
            Ok(Command::Noop) => ("noop", None, None),
            Ok(Command::Append { stime, entries }) => ("append", Some(entries.len()), Some(stime)),
            Err(_) => ("undecodable", None, None),
        };
        records.push(WalRecordInfo {
            offset,
            block: record.block.as_u64(),
            term: record.term,
            index: record.index,
            command,
            entries,
            stime,
        });
    }
    Ok(records)
}

fn print_text_output(records: &[WalRecordInfo]) {
    println!("WAL Records ({} total)", records.len());
    println!("================");
    println!();

    for record in records {
        print!(
            "[{:010}] block={} term={} index={} {}",
            record.offset, record.block, record.term, record.index, record.command
        );
        if let Some(entries) = record.entries {
            print!(" entries={entries}");
        }
        if let Some(stime) = record.stime {
            print!(" stime={stime}");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evlog_core::wal::{Wal, WalRecord};
    use evlog_core::BlockId;
    use evlog_storage::MemoryVolume;

    fn record(block: u64, index: u64, command: &Command) -> WalRecord {
        WalRecord {
            block: BlockId::new(block),
            term: 1,
            index,
            data: command.encode().unwrap(),
        }
    }

    #[tokio::test]
    async fn dumps_and_filters_records() {
        let volume = MemoryVolume::new();
        let wal = Wal::open(volume.open(WAL_FILE).unwrap(), false, |_, _| Ok(())).unwrap();
        let append = Command::Append {
            stime: 1_700_000_000_000,
            entries: vec![vec![1], vec![2]],
        };
        wal.append(vec![
            record(1, 1, &Command::Noop),
            record(2, 1, &Command::Noop),
            record(1, 2, &append),
        ])
        .await
        .unwrap();
        wal.wait();

        let backend = volume.open(WAL_FILE).unwrap();
        let all = read_records(backend.as_ref(), None, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].offset, 0);

        let first = read_records(backend.as_ref(), None, Some(1)).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].command, "append");
        assert_eq!(first[1].entries, Some(2));
        assert_eq!(first[1].stime, Some(1_700_000_000_000));

        assert_eq!(read_records(backend.as_ref(), Some(1), None).unwrap().len(), 1);
    }
}
