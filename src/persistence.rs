//! # Persistence
//!
//! Crash-safe storage of a [`Store`] in a single artifact file.
//!
//! ## Save cycle
//! 0. A `<path>.bak` left behind by an earlier crash is discarded.
//! 1. If the artifact exists, copy it to a temporary file, `fsync` it, and only
//!    then rename it to `<path>.bak`.
//! 2. Write the new snapshot to a temporary file in the same directory, `fsync`
//!    it, and rename it over the artifact. Readers see either the old file or
//!    the new one, never a half-written one.
//! 3. Remove the backup.
//!
//! If step 2 or 3 fails, the backup taken in step 1 is renamed back over the
//! artifact. A failure before the backup is complete leaves the artifact as it
//! was. Either way the save reports [`MemoryError::Persistence`], and the
//! in-memory store is never touched by a failed save.
//!
//! ## Artifact layout
//! ```text
//! +----------+-------------+----------------+------------------------------+
//! | RECALLDB | version u32 | blake3(payload)| payload (bincode, standard)  |
//! | 8 bytes  | 4 bytes LE  | 32 bytes       | {records, metadata, index}   |
//! +----------+-------------+----------------+------------------------------+
//! ```
//! `index` is the opaque blob produced by
//! [`SimilarityIndex::to_bytes`]. Record payloads (`extra`) are kept as JSON text
//! so the binary codec never has to decode self-describing values.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::error::{MemoryError, Result};
use crate::index::SimilarityIndex;
use crate::records::{Extra, Record, RecordMeta, RecordStore};
use crate::store::Store;

const MAGIC: &[u8; 8] = b"RECALLDB";
const FORMAT_VERSION: u32 = 1;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 4 + DIGEST_LEN;
const BACKUP_SUFFIX: &str = ".bak";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<PersistedRecord>,
    metadata: Vec<RecordMeta>,
    index: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    text: String,
    timestamp: DateTime<Utc>,
    extra: String,
}

impl PersistedRecord {
    fn from_record(record: &Record) -> Result<Self> {
        let extra = serde_json::to_string(&record.extra)
            .map_err(|e| MemoryError::persistence("encoding record payload", e))?;
        Ok(Self {
            text: record.text.clone(),
            timestamp: record.timestamp,
            extra,
        })
    }

    fn into_record(self) -> Result<Record> {
        let extra: Extra = serde_json::from_str(&self.extra)
            .map_err(|e| MemoryError::persistence("decoding record payload", e))?;
        Ok(Record {
            text: self.text,
            timestamp: self.timestamp,
            extra,
        })
    }
}

/// Owner of the artifact file and its transient backup.
#[derive(Debug, Clone)]
pub struct Persistence {
    path: PathBuf,
}

impl Persistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<path>.bak`; only exists while a save is in flight.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Durably replace the artifact with a snapshot of `store`.
    pub fn save<I: SimilarityIndex>(&self, store: &Store<I>) -> Result<()> {
        self.save_with(store, |file, bytes| file.write_all(bytes))
    }

    /// [`save`](Self::save) with the payload write step supplied by the caller.
    pub(crate) fn save_with<I, W>(&self, store: &Store<I>, write: W) -> Result<()>
    where
        I: SimilarityIndex,
        W: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        let bytes = encode(store)?;
        let backup = self.backup_path();
        let mut backed_up = false;

        match self.replace(&backup, &bytes, write, &mut backed_up) {
            Ok(()) => {
                debug!(
                    "Saved {} memories ({} bytes) to {}",
                    store.len(),
                    bytes.len(),
                    self.path.display()
                );
                Ok(())
            }
            Err(e) => {
                error!("Saving memory store to {} failed: {e}", self.path.display());
                // Only a backup completed by this cycle is a copy of the artifact.
                if backed_up {
                    self.rollback(&backup);
                }
                Err(e)
            }
        }
    }

    fn replace<W>(&self, backup: &Path, bytes: &[u8], write: W, backed_up: &mut bool) -> Result<()>
    where
        W: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        if backup.exists() {
            warn!("Discarding stale backup {}", backup.display());
            fs::remove_file(backup)
                .map_err(|e| MemoryError::persistence("removing stale backup", e))?;
        }

        let dir = self.dir();
        fs::create_dir_all(dir)
            .map_err(|e| MemoryError::persistence("creating data directory", e))?;

        if self.path.exists() {
            self.stage_backup(dir, backup)?;
            *backed_up = true;
        }

        let mut staged = NamedTempFile::new_in(dir)
            .map_err(|e| MemoryError::persistence("creating staging file", e))?;
        write(staged.as_file_mut(), bytes)
            .map_err(|e| MemoryError::persistence("writing artifact", e))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| MemoryError::persistence("syncing artifact", e))?;
        staged
            .persist(&self.path)
            .map_err(|e| MemoryError::persistence("replacing artifact", e.error))?;
        sync_dir(dir);

        if *backed_up {
            fs::remove_file(backup)
                .map_err(|e| MemoryError::persistence("removing backup", e))?;
        }
        Ok(())
    }

    /// Copy the artifact to a temporary file, and only name it `<path>.bak` once
    /// the copy is complete and synced.
    fn stage_backup(&self, dir: &Path, backup: &Path) -> Result<()> {
        let mut staged = NamedTempFile::new_in(dir)
            .map_err(|e| MemoryError::persistence("creating backup file", e))?;
        let mut current = File::open(&self.path)
            .map_err(|e| MemoryError::persistence("opening artifact for backup", e))?;
        io::copy(&mut current, staged.as_file_mut())
            .map_err(|e| MemoryError::persistence("backing up artifact", e))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| MemoryError::persistence("syncing backup", e))?;
        staged
            .persist(backup)
            .map_err(|e| MemoryError::persistence("naming backup", e.error))?;
        Ok(())
    }

    fn rollback(&self, backup: &Path) {
        match fs::rename(backup, &self.path) {
            Ok(()) => warn!(
                "Restored {} from its backup after a failed save",
                self.path.display()
            ),
            // Keep the backup: it is the only complete copy left.
            Err(e) => error!(
                "Could not restore {} from {}: {e}",
                self.path.display(),
                backup.display()
            ),
        }
    }

    /// Read the artifact back.
    ///
    /// `Ok(None)` means there is no artifact yet. Anything unreadable, corrupt, or
    /// built for another dimension is a [`MemoryError::Persistence`].
    pub fn load<I: SimilarityIndex>(&self, dimension: usize) -> Result<Option<Store<I>>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No existing memory store at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(MemoryError::persistence("reading artifact", e)),
        };

        let store = decode(&bytes, dimension)?;
        debug!(
            "Decoded {} memories from {}",
            store.len(),
            self.path.display()
        );
        Ok(Some(store))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Could not sync directory {}: {e}", dir.display());
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn encode<I: SimilarityIndex>(store: &Store<I>) -> Result<Vec<u8>> {
    let records = store
        .records()
        .iter()
        .map(PersistedRecord::from_record)
        .collect::<Result<Vec<_>>>()?;

    let snapshot = Snapshot {
        records,
        metadata: store.records().metadata(),
        index: store.index().to_bytes()?,
    };

    let payload = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
        .map_err(|e| MemoryError::persistence("encoding snapshot", e))?;
    Ok(seal(&payload))
}

fn seal(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(blake3::hash(payload).as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn unseal(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return Err(MemoryError::Persistence(format!(
            "artifact truncated: {} bytes is shorter than the header",
            bytes.len()
        )));
    }

    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(MemoryError::Persistence("not a memory store artifact".into()));
    }

    let (version, rest) = rest.split_at(4);
    let version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    if version != FORMAT_VERSION {
        return Err(MemoryError::Persistence(format!(
            "unsupported artifact version {version}"
        )));
    }

    let (digest, payload) = rest.split_at(DIGEST_LEN);
    if blake3::hash(payload).as_bytes()[..] != digest[..] {
        return Err(MemoryError::Persistence("artifact checksum mismatch".into()));
    }

    Ok(payload)
}

fn decode<I: SimilarityIndex>(bytes: &[u8], dimension: usize) -> Result<Store<I>> {
    let payload = unseal(bytes)?;

    let (snapshot, read): (Snapshot, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| MemoryError::persistence("decoding snapshot", e))?;
    if read != payload.len() {
        return Err(MemoryError::Persistence(format!(
            "{} trailing bytes after snapshot",
            payload.len() - read
        )));
    }

    if snapshot.metadata.len() != snapshot.records.len() {
        return Err(MemoryError::Persistence(format!(
            "{} metadata entries for {} records",
            snapshot.metadata.len(),
            snapshot.records.len()
        )));
    }

    let records = snapshot
        .records
        .into_iter()
        .map(PersistedRecord::into_record)
        .collect::<Result<Vec<_>>>()?;

    if let Some(pos) = records
        .iter()
        .zip(&snapshot.metadata)
        .position(|(record, meta)| record.meta() != *meta)
    {
        return Err(MemoryError::Persistence(format!(
            "metadata entry {pos} does not match its record"
        )));
    }

    let index = I::from_bytes(&snapshot.index)?;
    if index.dimension() != dimension {
        return Err(MemoryError::Persistence(format!(
            "artifact holds {}-dimensional vectors, store expects {dimension}",
            index.dimension()
        )));
    }

    Store::from_parts(index, RecordStore::from_records(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FlatIndex;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_store() -> Store {
        let mut store: Store = Store::new(3);
        store
            .add(
                "What is the capital of France?".into(),
                &[0.1, 0.2, 0.3],
                json!({"response": "Paris", "used_context": false})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .unwrap();
        store
            .add(
                "How tall is Everest?".into(),
                &[0.9, -0.4, 0.0],
                json!({"response": "8849 m", "used_context": true})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_load_without_artifact_is_none() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        assert!(persistence.load::<FlatIndex>(3).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_reconstructs_store() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        let store = sample_store();

        persistence.save(&store).unwrap();
        let loaded: Store = persistence.load(3).unwrap().unwrap();

        assert_eq!(loaded, store);
        assert_eq!(loaded.records().metadata(), store.records().metadata());
        assert_eq!(
            loaded.search(&[0.0, 0.0, 0.0], 2).unwrap(),
            store.search(&[0.0, 0.0, 0.0], 2).unwrap()
        );
        assert!(!persistence.backup_path().exists());
    }

    #[test]
    fn test_save_twice_is_byte_identical() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        let store = sample_store();

        persistence.save(&store).unwrap();
        let first = fs::read(persistence.path()).unwrap();
        assert!(!persistence.backup_path().exists());

        persistence.save(&store).unwrap();
        let second = fs::read(persistence.path()).unwrap();
        assert!(!persistence.backup_path().exists());

        assert_eq!(first, second);
    }

    #[test]
    fn test_save_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("a").join("b").join("db.bin"));
        persistence.save(&sample_store()).unwrap();
        assert!(persistence.path().exists());
    }

    #[test]
    fn test_failed_write_rolls_back_to_previous_state() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));

        let before = sample_store();
        persistence.save(&before).unwrap();

        let mut after = before.clone();
        after
            .add("Unsaved question".into(), &[1.0, 1.0, 1.0], Extra::new())
            .unwrap();

        let result = persistence.save_with(&after, |file, bytes| {
            file.write_all(&bytes[..bytes.len() / 2])?;
            Err(io::Error::other("simulated disk failure"))
        });

        assert!(matches!(result, Err(MemoryError::Persistence(_))));
        assert!(!persistence.backup_path().exists());
        let reloaded: Store = persistence.load(3).unwrap().unwrap();
        assert_eq!(reloaded, before);
    }

    #[test]
    fn test_failed_first_write_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));

        let result = persistence.save_with(&sample_store(), |_, _| {
            Err(io::Error::other("simulated disk failure"))
        });

        assert!(result.is_err());
        assert!(!persistence.path().exists());
        assert!(!persistence.backup_path().exists());
        assert!(persistence.load::<FlatIndex>(3).unwrap().is_none());
    }

    #[test]
    fn test_stale_backup_is_never_installed() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        fs::write(persistence.backup_path(), b"stale leftover").unwrap();

        let result = persistence.save_with(&sample_store(), |_, _| {
            Err(io::Error::other("simulated disk failure"))
        });

        assert!(result.is_err());
        assert!(!persistence.path().exists());
        assert!(!persistence.backup_path().exists());
        assert!(persistence.load::<FlatIndex>(3).unwrap().is_none());
    }

    #[test]
    fn test_stale_backup_does_not_replace_artifact() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));

        let before = sample_store();
        persistence.save(&before).unwrap();
        fs::write(persistence.backup_path(), b"stale leftover").unwrap();

        let result = persistence.save_with(&Store::<FlatIndex>::new(3), |_, _| {
            Err(io::Error::other("simulated disk failure"))
        });

        assert!(result.is_err());
        assert!(!persistence.backup_path().exists());
        let reloaded: Store = persistence.load(3).unwrap().unwrap();
        assert_eq!(reloaded, before);
    }

    #[test]
    fn test_save_succeeds_over_stale_backup() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        fs::write(persistence.backup_path(), b"stale leftover").unwrap();

        let store = sample_store();
        persistence.save(&store).unwrap();

        assert!(!persistence.backup_path().exists());
        let reloaded: Store = persistence.load(3).unwrap().unwrap();
        assert_eq!(reloaded, store);
    }

    #[test]
    fn test_incomplete_backup_is_not_restored() {
        let dir = tempdir().unwrap();
        // A directory at the artifact path cannot be read, so the backup copy fails.
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        fs::create_dir(persistence.path()).unwrap();

        let result = persistence.save(&sample_store());

        assert!(matches!(result, Err(MemoryError::Persistence(_))));
        assert!(persistence.path().is_dir());
        assert!(!persistence.backup_path().exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_load_rejects_truncated_artifact() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        persistence.save(&sample_store()).unwrap();

        let bytes = fs::read(persistence.path()).unwrap();
        fs::write(persistence.path(), &bytes[..bytes.len() - 5]).unwrap();
        assert!(persistence.load::<FlatIndex>(3).is_err());

        fs::write(persistence.path(), &bytes[..10]).unwrap();
        assert!(persistence.load::<FlatIndex>(3).is_err());
    }

    #[test]
    fn test_load_rejects_flipped_byte() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        persistence.save(&sample_store()).unwrap();

        let mut bytes = fs::read(persistence.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(persistence.path(), &bytes).unwrap();

        let err = persistence.load::<FlatIndex>(3).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_load_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vector_db.bin");
        fs::write(&path, vec![0u8; HEADER_LEN + 16]).unwrap();
        let err = Persistence::new(path).load::<FlatIndex>(3).unwrap_err();
        assert!(err.to_string().contains("not a memory store"));
    }

    #[test]
    fn test_load_rejects_other_dimension() {
        let dir = tempdir().unwrap();
        let persistence = Persistence::new(dir.path().join("vector_db.bin"));
        persistence.save(&sample_store()).unwrap();

        assert!(matches!(
            persistence.load::<FlatIndex>(384),
            Err(MemoryError::Persistence(_))
        ));
    }

    #[test]
    fn test_load_rejects_misaligned_metadata() {
        let store = sample_store();
        let snapshot = Snapshot {
            records: store
                .records()
                .iter()
                .map(PersistedRecord::from_record)
                .collect::<Result<Vec<_>>>()
                .unwrap(),
            metadata: store.records().metadata()[..1].to_vec(),
            index: store.index().to_bytes().unwrap(),
        };
        let payload =
            bincode::serde::encode_to_vec(&snapshot, bincode::config::standard()).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("vector_db.bin");
        fs::write(&path, seal(&payload)).unwrap();

        let err = Persistence::new(path).load::<FlatIndex>(3).unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn test_backup_path_appends_suffix() {
        let persistence = Persistence::new("/var/lib/recall/vector_db.bin");
        assert_eq!(
            persistence.backup_path(),
            PathBuf::from("/var/lib/recall/vector_db.bin.bak")
        );
    }
}
