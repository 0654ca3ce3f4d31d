//! Group-commit WAL writer.

use super::iterator::WalIterator;
use super::record::{decode_framed, parse_header, WalRecord, CRC_SIZE, HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use evlog_storage::StorageBackend;
use parking_lot::Mutex;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type Backend = Arc<Mutex<Box<dyn StorageBackend>>>;
type Completion = oneshot::Sender<CoreResult<Vec<u64>>>;

struct WriteRequest {
    records: Vec<WalRecord>,
    done: Completion,
}

/// The node-wide write-ahead log.
///
/// Appends are queued to a dedicated writer thread. The thread takes every
/// request waiting in the queue, writes them back to back, syncs once and
/// then completes each request with the offsets of its records. Callers on
/// different blocks therefore share one fsync.
///
/// Shutdown is two-phase: [`Wal::close`] stops accepting appends and lets
/// the writer drain what is queued, [`Wal::wait`] blocks until it has.
pub struct Wal {
    backend: Backend,
    sender: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Replays `backend` through `visit`, cuts any torn tail and starts the
    /// writer thread.
    ///
    /// # Errors
    ///
    /// Corruption in the log, an error returned by `visit`, or a storage
    /// failure.
    pub fn open<F>(mut backend: Box<dyn StorageBackend>, sync: bool, mut visit: F) -> CoreResult<Self>
    where
        F: FnMut(u64, WalRecord) -> CoreResult<()>,
    {
        let size = backend.size()?;
        let mut replayed = 0usize;
        let valid = {
            let mut iter = WalIterator::new(&*backend)?;
            for item in iter.by_ref() {
                let (offset, record) = item?;
                visit(offset, record)?;
                replayed += 1;
            }
            iter.valid_len()
        };
        if valid < size {
            warn!(valid, size, "truncating torn WAL tail");
            backend.truncate(valid)?;
        }
        info!(records = replayed, size = valid, "WAL replayed");

        let backend: Backend = Arc::new(Mutex::new(backend));
        let (tx, rx) = mpsc::channel();
        let worker_backend = Arc::clone(&backend);
        let worker = std::thread::Builder::new()
            .name("evlog-wal".into())
            .spawn(move || run_writer(&worker_backend, &rx, sync))?;

        Ok(Self {
            backend,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Durably appends `records`, returning the offset of each.
    ///
    /// # Errors
    ///
    /// [`CoreError::Closed`] after [`Wal::close`], or the write error.
    pub async fn append(&self, records: Vec<WalRecord>) -> CoreResult<Vec<u64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let (done, wait) = oneshot::channel();
        {
            let sender = self.sender.lock();
            let sender = sender.as_ref().ok_or(CoreError::Closed("WAL"))?;
            sender
                .send(WriteRequest { records, done })
                .map_err(|_| CoreError::Closed("WAL"))?;
        }
        wait.await.map_err(|_| CoreError::Closed("WAL"))?
    }

    /// Reads the record at `offset`.
    ///
    /// # Errors
    ///
    /// Corruption or storage errors.
    pub fn read(&self, offset: u64) -> CoreResult<WalRecord> {
        let backend = self.backend.lock();
        let head = backend.read_at(offset, HEADER_SIZE)?;
        let header = parse_header(&head, offset)?;
        let frame = backend.read_at(offset, HEADER_SIZE + header.payload_len + CRC_SIZE)?;
        decode_framed(&frame, header)
    }

    /// Current size in bytes.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Stops accepting appends. Queued appends still complete.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            debug!("WAL closed for appends");
        }
    }

    /// Blocks until the writer thread has drained its queue and exited.
    /// Implies [`Wal::close`].
    pub fn wait(&self) {
        self.close();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("WAL writer thread panicked");
            }
            info!("WAL drained");
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("open", &self.sender.lock().is_some())
            .finish_non_exhaustive()
    }
}

fn run_writer(backend: &Backend, rx: &mpsc::Receiver<WriteRequest>, sync: bool) {
    while let Ok(first) = rx.recv() {
        let mut group = vec![first];
        group.extend(rx.try_iter());

        let mut backend = backend.lock();
        let mut results = Vec::with_capacity(group.len());
        for request in &group {
            results.push(write_records(&mut **backend, &request.records));
        }
        let durable = if sync { backend.sync() } else { backend.flush() };
        drop(backend);

        if let Err(e) = &durable {
            error!(error = %e, "WAL sync failed");
        }
        for (request, result) in group.into_iter().zip(results) {
            let result = match (&durable, result) {
                (Err(e), _) => Err(CoreError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))),
                (Ok(()), r) => r,
            };
            // The caller may have given up waiting.
            let _ = request.done.send(result);
        }
    }
    debug!("WAL writer exiting");
}

fn write_records(backend: &mut dyn StorageBackend, records: &[WalRecord]) -> CoreResult<Vec<u64>> {
    let mut buf = Vec::new();
    let mut relative = Vec::with_capacity(records.len());
    for record in records {
        relative.push(buf.len() as u64);
        buf.extend_from_slice(&record.encode()?);
    }
    let base = backend.append(&buf)?;
    Ok(relative.into_iter().map(|r| base + r).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockId;
    use evlog_storage::InMemoryBackend;

    fn record(block: u64, index: u64) -> WalRecord {
        WalRecord {
            block: BlockId::new(block),
            term: 1,
            index,
            data: format!("cmd-{index}").into_bytes(),
        }
    }

    fn open(backend: &InMemoryBackend) -> (Wal, Vec<(u64, WalRecord)>) {
        let mut seen = Vec::new();
        let wal = Wal::open(Box::new(backend.clone()), false, |offset, r| {
            seen.push((offset, r));
            Ok(())
        })
        .unwrap();
        (wal, seen)
    }

    #[tokio::test]
    async fn append_then_read_back_by_offset() {
        let backend = InMemoryBackend::new();
        let (wal, seen) = open(&backend);
        assert!(seen.is_empty());

        let offsets = wal.append(vec![record(1, 1), record(2, 1)]).await.unwrap();
        let more = wal.append(vec![record(1, 2)]).await.unwrap();
        assert_eq!(offsets[0], 0);
        assert!(offsets[1] > offsets[0] && more[0] > offsets[1]);
        assert_eq!(wal.read(offsets[1]).unwrap(), record(2, 1));
        assert_eq!(wal.read(more[0]).unwrap(), record(1, 2));
    }

    #[tokio::test]
    async fn reopen_replays_in_order() {
        let backend = InMemoryBackend::new();
        {
            let (wal, _) = open(&backend);
            for i in 1..=5 {
                wal.append(vec![record(7, i)]).await.unwrap();
            }
            wal.wait();
        }
        let (_wal, seen) = open(&backend);
        let indexes: Vec<_> = seen.iter().map(|(_, r)| r.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn torn_tail_is_cut_on_open() {
        let backend = InMemoryBackend::new();
        {
            let (wal, _) = open(&backend);
            wal.append(vec![record(1, 1), record(1, 2)]).await.unwrap();
            wal.wait();
        }
        let mut raw = backend.clone();
        let size = raw.size().unwrap();
        raw.truncate(size - 1).unwrap();

        let (wal, seen) = open(&backend);
        assert_eq!(seen.len(), 1);
        let offsets = wal.append(vec![record(1, 2)]).await.unwrap();
        assert_eq!(offsets[0], record(1, 1).encode().unwrap().len() as u64);
    }

    #[tokio::test]
    async fn append_after_close_fails() {
        let backend = InMemoryBackend::new();
        let (wal, _) = open(&backend);
        wal.close();
        assert!(matches!(
            wal.append(vec![record(1, 1)]).await,
            Err(CoreError::Closed(_))
        ));
        wal.wait();
        wal.wait();
    }

    #[tokio::test]
    async fn concurrent_appends_all_land() {
        let backend = InMemoryBackend::new();
        let (wal, _) = open(&backend);
        let wal = Arc::new(wal);
        let mut tasks = Vec::new();
        for block in 1..=8u64 {
            let wal = Arc::clone(&wal);
            tasks.push(tokio::spawn(async move {
                for i in 1..=10 {
                    wal.append(vec![record(block, i)]).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        wal.wait();
        let (_wal, seen) = open(&backend);
        assert_eq!(seen.len(), 80);
    }
}
