//! # Durable sequence store
//!
//! Owns the on-disk sequence block and hands out sequence values under the
//! reservation-ahead contract: the persisted `sequence` field is a ceiling
//! that is written *before* any value below it is issued, so a crash can
//! only skip values, never repeat them. `fdatasync` of those writes is
//! delegated to the [`sync`](super::sync) thread; restart recovery adds a
//! full extra reservation to cover a flush that may still have been in
//! flight.
//!
//! Any write failure latches the store: a short write may have corrupted the
//! persisted ceiling, and continuing could reissue a value. Only a restart
//! (which re-reads and re-validates the block) clears the latch.

use super::sync::SyncShared;
use seqmint::{BLOCK_LEN, BLOCK_VERSION, BlockError, SeqBlock};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("opening sequence file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading sequence file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sequence file {path} is unusable: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: BlockError,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sequence store is latched after an earlier write failure")]
    Latched,
    #[error("writing the sequence block: {0}")]
    Write(#[source] io::Error),
    #[error("short write persisting the sequence block: {written}/{BLOCK_LEN} bytes")]
    ShortWrite { written: usize },
}

/// A sequence file that has been opened and validated but not yet activated.
///
/// Splitting open from activation lets the supervisor inspect the stored
/// label (and its renewal timestamp) to decide whether a fresh lease is
/// needed before any state is rewritten.
pub struct OpenStore {
    file: Arc<std::fs::File>,
    path: PathBuf,
    existing: Option<SeqBlock>,
}

impl OpenStore {
    /// Opens (or creates) the sequence file and reads any stored block.
    ///
    /// # Errors
    ///
    /// I/O failures, a truncated file, or a block failing its magic check.
    /// All of them are fatal at startup: a half-readable block cannot prove
    /// which values were already issued.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, OpenError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| OpenError::Io {
                path: path.clone(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| OpenError::Read {
                path: path.clone(),
                source,
            })?
            .len();

        let existing = if len == 0 {
            None
        } else if len < BLOCK_LEN as u64 {
            return Err(OpenError::Invalid {
                path,
                source: BlockError::Truncated { got: len as usize },
            });
        } else {
            let mut buf = [0u8; BLOCK_LEN];
            file.read_exact_at(&mut buf, 0)
                .map_err(|source| OpenError::Read {
                    path: path.clone(),
                    source,
                })?;
            let block = SeqBlock::decode(&buf).map_err(|source| OpenError::Invalid {
                path: path.clone(),
                source,
            })?;
            tracing::info!(%block, "restored sequence block");
            Some(block)
        };

        Ok(Self {
            file: Arc::new(file),
            path,
            existing,
        })
    }

    /// The block read from disk, if the file was not empty.
    pub fn existing(&self) -> Option<&SeqBlock> {
        self.existing.as_ref()
    }

    /// Activates the store with a resolved label and renewal timestamp.
    ///
    /// A fresh file starts issuing at `steps`; a restored file skips a full
    /// `2 * steps` past the stored ceiling, because the reservation written
    /// just before a crash may never have been flushed. Either way the new
    /// ceiling is persisted before any value is handed out.
    pub fn activate(
        self,
        label: u8,
        timestamp: u64,
        steps: u32,
        shared: Arc<SyncShared>,
    ) -> Result<SequenceStore, StoreError> {
        let next = match &self.existing {
            None => steps,
            Some(block) => block.sequence.wrapping_add(steps.wrapping_mul(2)),
        };
        let mut store = SequenceStore {
            file: self.file,
            path: self.path,
            steps,
            shared,
            block: SeqBlock {
                version: BLOCK_VERSION,
                label: u32::from(label),
                sequence: next,
                timestamp,
                magic: 0,
            },
            next,
            io_error: false,
        };
        store.write_block()?;
        Ok(store)
    }
}

/// The activated store. Owned and mutated exclusively by the dispatcher.
pub struct SequenceStore {
    file: Arc<std::fs::File>,
    path: PathBuf,
    steps: u32,
    shared: Arc<SyncShared>,
    block: SeqBlock,
    next: u32,
    io_error: bool,
}

impl SequenceStore {
    /// Allocates `count` consecutive sequence values (0 means 1) and returns
    /// the first. The whole range `[start, start + count)` is covered by the
    /// persisted ceiling before this returns. Value 0 is never issued; it is
    /// the wire protocol's failure sentinel.
    ///
    /// # Errors
    ///
    /// [`StoreError::Latched`] once any earlier write failed; otherwise the
    /// write error that just latched the store.
    pub fn allocate(&mut self, count: u16) -> Result<u32, StoreError> {
        if self.io_error {
            return Err(StoreError::Latched);
        }
        let n = u32::from(count.max(1));
        let skip_zero = u32::from(self.next == 0);
        let need = n + skip_zero;
        let remaining = self.block.sequence.wrapping_sub(self.next);
        if remaining < need {
            self.block.sequence = self.next.wrapping_add(self.steps.max(need));
            self.write_block()?;
        }
        if skip_zero == 1 {
            self.next = 1;
        }
        let start = self.next;
        self.next = self.next.wrapping_add(n);
        self.shared.note_issued(n, self.steps);
        Ok(start)
    }

    /// Applies a renewal from a master: refreshes the lease timestamp and,
    /// when the label actually changed, persists the block immediately.
    pub fn renew_label(&mut self, label: u8, now: u64) -> Result<(), StoreError> {
        let old = self.block.label;
        self.block.label = u32::from(label);
        self.block.timestamp = now;
        if old != u32::from(label) {
            tracing::info!(old, new = label, "label changed");
            self.write_block()?;
        }
        Ok(())
    }

    /// Forgets the cached label (in memory only). Used when a master reports
    /// the label is held by someone else; the next renewal asks for a fresh
    /// one.
    pub fn clear_label(&mut self) {
        self.block.label = 0;
    }

    pub fn label(&self) -> u8 {
        self.block.label as u8
    }

    pub fn block(&self) -> &SeqBlock {
        &self.block
    }

    pub fn io_error(&self) -> bool {
        self.io_error
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn file(&self) -> Arc<std::fs::File> {
        Arc::clone(&self.file)
    }

    pub fn shared(&self) -> Arc<SyncShared> {
        Arc::clone(&self.shared)
    }

    fn write_block(&mut self) -> Result<(), StoreError> {
        self.block.update_magic();
        let buf = self.block.encode();
        match self.file.write_at(&buf, 0) {
            Ok(written) if written == BLOCK_LEN => {
                tracing::debug!(block = %self.block, "stored sequence block");
                self.shared.flush_soon();
                Ok(())
            }
            Ok(written) => {
                self.io_error = true;
                tracing::error!(written, block = %self.block, "short write storing sequence block");
                Err(StoreError::ShortWrite { written })
            }
            Err(source) => {
                self.io_error = true;
                tracing::error!(err = %source, block = %self.block, "storing sequence block failed");
                Err(StoreError::Write(source))
            }
        }
    }

    #[cfg(test)]
    fn latch_for_tests(&mut self) {
        self.io_error = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::os::unix::fs::FileExt;

    fn open_in(dir: &tempfile::TempDir) -> OpenStore {
        OpenStore::open(dir.path().join(".uniq.seq")).unwrap()
    }

    fn disk_block(dir: &tempfile::TempDir) -> SeqBlock {
        let data = std::fs::read(dir.path().join(".uniq.seq")).unwrap();
        SeqBlock::decode(&data).unwrap()
    }

    #[test]
    fn fresh_store_issues_from_steps() {
        let dir = tempfile::tempdir().unwrap();
        let open = open_in(&dir);
        assert!(open.existing().is_none());
        let mut store = open.activate(7, 0, 100, SyncShared::new()).unwrap();

        // First allocation bumps the ceiling one full reservation ahead.
        assert_eq!(store.allocate(1).unwrap(), 100);
        assert_eq!(disk_block(&dir).sequence, 200);

        for expected in 101..200 {
            assert_eq!(store.allocate(1).unwrap(), expected);
        }
        // The 101st allocation crosses the ceiling and rewrites the block.
        assert_eq!(store.allocate(1).unwrap(), 200);
        assert_eq!(disk_block(&dir).sequence, 300);
    }

    #[test]
    fn ceiling_always_covers_every_issued_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir).activate(7, 0, 50, SyncShared::new()).unwrap();
        for count in [1u16, 3, 7, 49, 50, 1] {
            let start = store.allocate(count).unwrap();
            let ceiling = disk_block(&dir).sequence;
            assert!(
                ceiling >= start + u32::from(count),
                "ceiling {ceiling} below issued range end {}",
                start + u32::from(count)
            );
        }
    }

    #[test]
    fn batch_allocation_reserves_the_whole_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir).activate(7, 0, 100, SyncShared::new()).unwrap();
        let start = store.allocate(90).unwrap();
        assert_eq!(start, 100);
        // A follow-up batch larger than what remains must bump again.
        let start = store.allocate(90).unwrap();
        assert_eq!(start, 190);
        assert!(disk_block(&dir).sequence >= 280);
    }

    #[test]
    fn zero_count_means_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir).activate(7, 0, 100, SyncShared::new()).unwrap();
        assert_eq!(store.allocate(0).unwrap(), 100);
        assert_eq!(store.allocate(0).unwrap(), 101);
    }

    #[test]
    fn restart_skips_two_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir).activate(7, 0, 100, SyncShared::new()).unwrap();
        let mut issued = Vec::new();
        for _ in 0..51 {
            issued.push(store.allocate(1).unwrap());
        }
        let ceiling_before = disk_block(&dir).sequence;
        drop(store); // crash: nothing beyond the last block write survives

        let open = open_in(&dir);
        assert_eq!(open.existing().unwrap().sequence, ceiling_before);
        let mut store = open.activate(7, 0, 100, SyncShared::new()).unwrap();
        let first_after = store.allocate(1).unwrap();
        assert_eq!(first_after, ceiling_before + 200);
        assert!(first_after > *issued.last().unwrap());
    }

    #[test]
    fn no_duplicates_across_repeated_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = HashSet::new();
        for round in 0..8 {
            let open = open_in(&dir);
            let mut store = open.activate(7, 0, 10, SyncShared::new()).unwrap();
            // Vary how far each incarnation gets before "crashing".
            for _ in 0..=(round * 3) {
                let seq = store.allocate(1).unwrap();
                assert!(seen.insert(seq), "sequence {seq} issued twice");
            }
        }
    }

    #[test]
    fn zero_is_never_issued() {
        let dir = tempfile::tempdir().unwrap();
        // Craft a block whose recovery point lands exactly on the wrap.
        let mut block = SeqBlock {
            version: BLOCK_VERSION,
            label: 7,
            sequence: u32::MAX - 199,
            timestamp: 0,
            magic: 0,
        };
        block.update_magic();
        let path = dir.path().join(".uniq.seq");
        std::fs::write(&path, block.encode()).unwrap();

        let open = OpenStore::open(&path).unwrap();
        let mut store = open.activate(7, 0, 100, SyncShared::new()).unwrap();
        // next wrapped to exactly 0; the store must skip it.
        assert_eq!(store.allocate(1).unwrap(), 1);
    }

    #[test]
    fn corrupt_block_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".uniq.seq");
        {
            let mut store = OpenStore::open(&path)
                .unwrap()
                .activate(7, 0, 100, SyncShared::new())
                .unwrap();
            store.allocate(1).unwrap();
        }
        // Flip one byte of the stored label.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_at(&[0xFF], 4).unwrap();
        assert!(matches!(
            OpenStore::open(&path),
            Err(OpenError::Invalid { .. })
        ));
    }

    #[test]
    fn truncated_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".uniq.seq");
        std::fs::write(&path, [1u8; 10]).unwrap();
        assert!(matches!(
            OpenStore::open(&path),
            Err(OpenError::Invalid { .. })
        ));
    }

    #[test]
    fn latch_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir).activate(7, 0, 100, SyncShared::new()).unwrap();
        store.allocate(1).unwrap();
        store.latch_for_tests();
        assert!(matches!(store.allocate(1), Err(StoreError::Latched)));
        assert!(matches!(store.allocate(1), Err(StoreError::Latched)));
    }

    #[test]
    fn renewal_persists_only_label_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir).activate(7, 50, 100, SyncShared::new()).unwrap();
        let ondisk = disk_block(&dir);

        // Same label: timestamp refresh stays in memory.
        store.renew_label(7, 1000).unwrap();
        assert_eq!(store.block().timestamp, 1000);
        assert_eq!(disk_block(&dir), ondisk);

        // New label: persisted immediately.
        store.renew_label(9, 2000).unwrap();
        assert_eq!(disk_block(&dir).label, 9);
        assert_eq!(disk_block(&dir).timestamp, 2000);
    }
}
