use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{data_loss, internal_error, FirestoreResult};
use crate::firestore::local::persistence::{PersistedState, Persistence, StateDelta};

/// The log is folded into the snapshot once it outgrows both this and the snapshot.
pub const DEFAULT_COMPACTION_BYTES: u64 = 1 << 20;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    log_position: u64,
    state: &'a PersistedState,
}

#[derive(Deserialize)]
struct Snapshot {
    log_position: u64,
    state: PersistedState,
}

#[derive(Serialize)]
struct LogRecordRef<'a> {
    position: u64,
    action: &'a str,
    delta: &'a StateDelta,
}

#[derive(Deserialize)]
struct LogRecord {
    position: u64,
    delta: StateDelta,
}

/// Durable backend: a JSON snapshot plus an append-only log of transaction deltas.
///
/// Each commit appends one line holding what the transaction changed and syncs it.
/// When the log outgrows the snapshot, the whole state is written to a sibling temp
/// file, synced and renamed over the snapshot, and the log is dropped. Every record
/// carries a position and the snapshot remembers the last one it contains, so records
/// left behind by a crash during compaction are skipped on load. A torn final line is
/// ignored.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    compaction_bytes: u64,
    next_position: u64,
    snapshot_bytes: u64,
    log_bytes: u64,
    started: bool,
}

impl FilePersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_compaction_threshold(path, DEFAULT_COMPACTION_BYTES)
    }

    pub fn with_compaction_threshold(path: impl AsRef<Path>, compaction_bytes: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            compaction_bytes,
            next_position: 1,
            snapshot_bytes: 0,
            log_bytes: 0,
            started: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_path(&self) -> PathBuf {
        self.sibling(".log")
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn read_snapshot(&self) -> FirestoreResult<Option<Snapshot>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(internal_error(format!(
                    "Failed to open local store file {}: {err}",
                    self.path.display()
                )))
            }
        };
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).map_err(|err| {
            internal_error(format!("Failed to read local store file {}: {err}", self.path.display()))
        })?;
        if buffer.is_empty() {
            return Ok(None);
        }
        let snapshot: Snapshot = serde_json::from_slice(&buffer).map_err(|err| {
            data_loss(format!(
                "Local store file {} is corrupt: {err}",
                self.path.display()
            ))
        })?;
        Ok(Some(snapshot))
    }

    /// Replays log records newer than `after` and returns the last position seen.
    fn replay_log(&mut self, state: &mut PersistedState, after: u64) -> FirestoreResult<u64> {
        let log_path = self.log_path();
        let file = match File::open(&log_path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(after),
            Err(err) => {
                return Err(internal_error(format!(
                    "Failed to open local store log {}: {err}",
                    log_path.display()
                )))
            }
        };
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|err| internal_error(format!("Failed to read local store log: {err}")))?;

        let mut last_position = after;
        let mut replayed = 0;
        let mut valid_bytes = 0;
        for (index, line) in lines.iter().enumerate() {
            let record: LogRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) if index + 1 == lines.len() => {
                    log::warn!("firestore::persistence: dropping torn log record: {err}");
                    // Later appends must not land behind the partial line.
                    OpenOptions::new()
                        .write(true)
                        .open(&log_path)
                        .and_then(|file| file.set_len(valid_bytes))
                        .map_err(|err| internal_error(format!("Failed to truncate local store log: {err}")))?;
                    break;
                }
                Err(err) => {
                    return Err(data_loss(format!(
                        "Local store log {} is corrupt at record {}: {err}",
                        log_path.display(),
                        index + 1
                    )))
                }
            };
            valid_bytes += line.len() as u64 + 1;
            if record.position <= last_position {
                continue;
            }
            last_position = record.position;
            state.apply_delta(record.delta);
            replayed += 1;
        }
        let on_disk = fs::metadata(&log_path).map(|meta| meta.len()).unwrap_or(valid_bytes);
        if on_disk + 1 == valid_bytes {
            // The last record lost only its line break.
            OpenOptions::new()
                .append(true)
                .open(&log_path)
                .and_then(|mut file| file.write_all(b"\n"))
                .map_err(|err| internal_error(format!("Failed to repair local store log: {err}")))?;
        }
        self.log_bytes = valid_bytes;
        if replayed > 0 {
            log::debug!("firestore::persistence: replayed {replayed} log records");
        }
        Ok(last_position)
    }

    fn ensure_parent_dir(&self) -> FirestoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    internal_error(format!("Failed to create local store directory: {err}"))
                })?;
            }
        }
        Ok(())
    }

    fn append(&mut self, action: &str, position: u64, delta: &StateDelta) -> FirestoreResult<()> {
        let mut line = serde_json::to_vec(&LogRecordRef {
            position,
            action,
            delta,
        })
        .map_err(|err| internal_error(format!("Failed to serialize changes for '{action}': {err}")))?;
        line.push(b'\n');

        let log_path = self.log_path();
        let previous_len = self.log_bytes;
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&log_path)?;
            let result = file.write_all(&line).and_then(|_| file.sync_data());
            if result.is_err() {
                // A partial record must not end up in front of later ones.
                let _ = file.set_len(previous_len);
            }
            result
        };
        write().map_err(|err| internal_error(format!("Failed to append changes for '{action}': {err}")))?;
        self.log_bytes += line.len() as u64;
        Ok(())
    }

    fn compact(&mut self, action: &str, position: u64, state: &PersistedState) -> FirestoreResult<()> {
        let serialized = serde_json::to_vec(&SnapshotRef {
            log_position: position,
            state,
        })
        .map_err(|err| internal_error(format!("Failed to serialize local store for '{action}': {err}")))?;

        let temp_path = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        };
        write().map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            internal_error(format!("Failed to write local store for '{action}': {err}"))
        })?;

        // Records up to `position` are in the snapshot now.
        match fs::remove_file(self.log_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => log::warn!("firestore::persistence: failed to drop compacted log: {err}"),
        }
        log::debug!(
            "firestore::persistence: compacted {} log bytes into a {} byte snapshot",
            self.log_bytes,
            serialized.len()
        );
        self.snapshot_bytes = serialized.len() as u64;
        self.log_bytes = 0;
        Ok(())
    }
}

impl Persistence for FilePersistence {
    fn load(&mut self) -> FirestoreResult<Option<PersistedState>> {
        let snapshot = self.read_snapshot()?;
        let has_log = self.log_path().exists();
        if snapshot.is_none() && !has_log {
            return Ok(None);
        }

        let (mut state, after) = match snapshot {
            Some(snapshot) => {
                self.snapshot_bytes = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
                let mut state = snapshot.state;
                state.rebuild_indexes()?;
                (state, snapshot.log_position)
            }
            None => (PersistedState::default(), 0),
        };
        let last_position = self.replay_log(&mut state, after)?;
        self.next_position = last_position + 1;
        state.rebuild_indexes()?;
        log::debug!(
            "firestore::persistence: loaded {} documents and {} pending batches from {}",
            state.remote_documents.len(),
            state.mutation_queue.len(),
            self.path.display()
        );
        Ok(Some(state))
    }

    fn commit(&mut self, action: &str, state: &PersistedState) -> FirestoreResult<()> {
        if !self.started {
            return Err(internal_error(format!(
                "Cannot commit '{action}': persistence has been shut down"
            )));
        }
        self.ensure_parent_dir()?;
        let position = self.next_position;
        let delta = state.pending_delta();
        if self.log_bytes >= self.compaction_bytes.max(self.snapshot_bytes) {
            self.compact(action, position, state)?;
        } else {
            self.append(action, position, &delta)?;
        }
        self.next_position += 1;
        log::trace!(
            "firestore::persistence: committed '{action}' at {position} ({} documents changed)",
            delta.document_count()
        );
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn shutdown(&mut self) -> FirestoreResult<()> {
        self.started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::mutation::Mutation;
    use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, Timestamp};
    use crate::firestore::value::ObjectValue;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("firestore-local-{}-{}.json", name, std::process::id()));
        path
    }

    fn cleanup(persistence: &FilePersistence) {
        let _ = fs::remove_file(persistence.path());
        let _ = fs::remove_file(persistence.log_path());
    }

    fn found(path: &str, micros: i64) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(micros),
            ObjectValue::empty(),
        )
    }

    /// Runs one transaction that caches `doc` and commits it.
    fn commit_document(persistence: &mut FilePersistence, state: &mut PersistedState, doc: Document) {
        state.begin(false);
        let read_time = doc.version();
        state.remote_documents.add(doc, read_time);
        persistence.commit("cache document", state).unwrap();
        state.commit();
    }

    #[test]
    fn missing_file_loads_nothing() {
        let mut persistence = FilePersistence::new(temp_path("missing"));
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn commit_then_load_restores_queue() {
        let path = temp_path("roundtrip");
        let mut state = PersistedState::default();
        state.mutation_queue.add_mutation_batch(
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::delete(DocumentKey::from_string("c/a").unwrap())],
        );

        let mut persistence = FilePersistence::new(&path);
        persistence.commit("write", &state).unwrap();

        let mut reopened = FilePersistence::new(&path);
        let loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.mutation_queue.len(), 1);
        assert!(loaded
            .mutation_queue
            .contains_key(&DocumentKey::from_string("c/a").unwrap()));
        cleanup(&persistence);
    }

    #[test]
    fn commits_append_only_what_changed() {
        let path = temp_path("append");
        let mut persistence = FilePersistence::new(&path);
        let mut state = PersistedState::default();
        commit_document(&mut persistence, &mut state, found("c/a", 1));
        let after_first = fs::metadata(persistence.log_path()).unwrap().len();
        commit_document(&mut persistence, &mut state, found("c/b", 2));

        // The second record holds c/b only, not the whole cache.
        assert!(!path.exists());
        let second = &fs::read_to_string(persistence.log_path()).unwrap()[after_first as usize..];
        assert!(second.contains("c/b") && !second.contains("c/a"));

        let loaded = FilePersistence::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded.remote_documents.len(), 2);
        cleanup(&persistence);
    }

    #[test]
    fn compaction_skips_records_already_in_the_snapshot() {
        let path = temp_path("compaction");
        let mut persistence = FilePersistence::with_compaction_threshold(&path, u64::MAX);
        let mut state = PersistedState::default();
        commit_document(&mut persistence, &mut state, found("c/a", 1));
        let stale_log = fs::read(persistence.log_path()).unwrap();

        persistence.compaction_bytes = 0;
        commit_document(&mut persistence, &mut state, found("c/a", 2));
        assert!(path.exists());
        assert!(!persistence.log_path().exists());

        // A crash between the snapshot rename and the log removal leaves old records.
        fs::write(persistence.log_path(), stale_log).unwrap();
        let loaded = FilePersistence::new(&path).load().unwrap().unwrap();
        let key = DocumentKey::from_string("c/a").unwrap();
        assert_eq!(loaded.remote_documents.get(&key).version(), SnapshotVersion::from_micros(2));
        cleanup(&persistence);
    }

    #[test]
    fn torn_final_record_is_ignored() {
        let path = temp_path("torn");
        let mut persistence = FilePersistence::new(&path);
        let mut state = PersistedState::default();
        commit_document(&mut persistence, &mut state, found("c/a", 1));
        let mut log = OpenOptions::new().append(true).open(persistence.log_path()).unwrap();
        log.write_all(br#"{"position":2,"delta":{"docu"#).unwrap();

        let mut reopened = FilePersistence::new(&path);
        let mut loaded = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.remote_documents.len(), 1);
        assert_eq!(reopened.next_position, 2);

        // The partial line is gone, so a later record replays cleanly.
        commit_document(&mut reopened, &mut loaded, found("c/b", 2));
        let loaded = FilePersistence::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded.remote_documents.len(), 2);
        cleanup(&persistence);
    }

    #[test]
    fn corrupt_file_is_data_loss() {
        let path = temp_path("corrupt");
        fs::write(&path, b"{not json").unwrap();
        let err = FilePersistence::new(&path).load().unwrap_err();
        assert_eq!(err.code_str(), "firestore/data-loss");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn shutdown_rejects_commits() {
        let path = temp_path("shutdown");
        let mut persistence = FilePersistence::new(&path);
        persistence.shutdown().unwrap();
        assert!(persistence.commit("write", &PersistedState::default()).is_err());
    }
}
