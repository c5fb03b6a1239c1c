use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use evoface_core::attendance::debounce_remaining;
use evoface_core::{Embedding, EmbeddingError, IdentityMeta, IdentityRecord, EMBEDDING_DIM};
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

/// Fixed-width local timestamp format: lexical order equals time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected 512)")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("stored embedding unusable: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("invalid stored timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("unknown identity '{0}'")]
    UnknownIdentity(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One attendance row to append.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEvent {
    pub identity_id: String,
    pub timestamp: NaiveDateTime,
    pub confidence: f32,
    pub base_score: f32,
    pub dynamic_score: f32,
    pub evidence_ref: Option<String>,
}

/// Result of the atomic debounce check-and-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { log_id: i64 },
    Debounced { remaining_secs: u64 },
}

/// A stored attendance row joined with the identity's display name.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub identity_id: String,
    pub name: String,
    pub timestamp: String,
    pub confidence: f64,
    pub base_score: f64,
    pub dynamic_score: f64,
    pub evidence_ref: Option<String>,
}

type IdentityRow = (String, String, Option<String>, Vec<u8>, Option<Vec<u8>>);

/// SQLite-backed identity and attendance storage.
///
/// Base and dynamic embeddings are encrypted with AES-256-GCM under a
/// per-installation 32-byte key stored at `{db_dir}/.key` (mode 0600).
/// Legacy plaintext blobs (2048 bytes) are accepted on read.
#[derive(Clone)]
pub struct IdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl IdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/evoface"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS identities (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     base_embedding BLOB NOT NULL,
                     dynamic_embedding BLOB,
                     default_shift TEXT,
                     last_updated TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS logs (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                     timestamp TEXT NOT NULL,
                     confidence REAL NOT NULL,
                     base_score REAL NOT NULL DEFAULT 0.0,
                     dynamic_score REAL NOT NULL DEFAULT 0.0,
                     evidence_ref TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_logs_identity_time ON logs(identity_id, timestamp);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert or replace an identity's enrollment. Clears any dynamic template
    /// and keeps the identity's attendance history.
    pub async fn register_identity(
        &self,
        meta: &IdentityMeta,
        base: &Embedding,
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_embedding(base.as_slice())?;
        let id = meta.id.clone();
        let name = meta.name.clone();
        let shift = meta.default_shift.clone();
        let now = now_text();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (id, name, base_embedding, dynamic_embedding, default_shift, last_updated)
                     VALUES (?1, ?2, ?3, NULL, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                         name = excluded.name,
                         base_embedding = excluded.base_embedding,
                         dynamic_embedding = NULL,
                         default_shift = excluded.default_shift,
                         last_updated = excluded.last_updated",
                    rusqlite::params![id, name, blob, shift, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Every enrolled identity, ordered by id.
    pub async fn load_all(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let rows: Vec<IdentityRow> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, default_shift, base_embedding, dynamic_embedding
                     FROM identities ORDER BY id",
                )?;
                let rows = stmt.query_map([], read_identity_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter().map(|row| self.decode_identity(row)).collect()
    }

    pub async fn get_identity(&self, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let id = id.to_string();
        let row: Option<IdentityRow> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, default_shift, base_embedding, dynamic_embedding
                         FROM identities WHERE id = ?1",
                        [&id],
                        read_identity_row,
                    )
                    .optional()?)
            })
            .await?;

        row.map(|row| self.decode_identity(row)).transpose()
    }

    /// Replace the dynamic template. Returns false if the identity is gone.
    pub async fn update_dynamic(&self, id: &str, dynamic: &Embedding) -> Result<bool, StoreError> {
        let blob = self.encrypt_embedding(dynamic.as_slice())?;
        let id = id.to_string();
        let now = now_text();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE identities SET dynamic_embedding = ?1, last_updated = ?2 WHERE id = ?3",
                    rusqlite::params![blob, now, id],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete an identity and, by cascade, its attendance rows.
    pub async fn remove_identity(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM identities WHERE id = ?1", [&id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Read the identity's last timestamp and insert `event` inside a single
    /// IMMEDIATE transaction, unless the last event is within `window`.
    pub async fn append_log_debounced(
        &self,
        event: &AttendanceEvent,
        window: chrono::Duration,
    ) -> Result<AppendOutcome, StoreError> {
        let event = event.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if !identity_exists(&tx, &event.identity_id)? {
                    return Ok(Err(StoreError::UnknownIdentity(event.identity_id)));
                }
                if let Some(text) = last_timestamp_text(&tx, &event.identity_id)? {
                    let last = match parse_timestamp(&text) {
                        Ok(last) => last,
                        Err(e) => return Ok(Err(e)),
                    };
                    if let Some(remaining_secs) =
                        debounce_remaining(last, event.timestamp, window)
                    {
                        return Ok(Ok(AppendOutcome::Debounced { remaining_secs }));
                    }
                }
                let log_id = insert_log(&tx, &event)?;
                tx.commit()?;
                Ok(Ok(AppendOutcome::Inserted { log_id }))
            })
            .await?
    }

    /// Append without any debounce check.
    pub async fn append_log(&self, event: &AttendanceEvent) -> Result<i64, StoreError> {
        let event = event.clone();
        self.conn
            .call(move |conn| {
                if !identity_exists(conn, &event.identity_id)? {
                    return Ok(Err(StoreError::UnknownIdentity(event.identity_id)));
                }
                Ok(Ok(insert_log(conn, &event)?))
            })
            .await?
    }

    /// Most recent attendance rows, newest first.
    pub async fn recent_logs(&self, limit: u32) -> Result<Vec<LogEntry>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT l.id, l.identity_id, i.name, l.timestamp, l.confidence,
                            l.base_score, l.dynamic_score, l.evidence_ref
                     FROM logs l JOIN identities i ON i.id = l.identity_id
                     ORDER BY l.timestamp DESC, l.id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], |row| {
                    Ok(LogEntry {
                        id: row.get(0)?,
                        identity_id: row.get(1)?,
                        name: row.get(2)?,
                        timestamp: row.get(3)?,
                        confidence: row.get(4)?,
                        base_score: row.get(5)?,
                        dynamic_score: row.get(6)?,
                        evidence_ref: row.get(7)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_identities(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    fn decode_identity(&self, row: IdentityRow) -> Result<IdentityRecord, StoreError> {
        let (id, name, default_shift, base_blob, dynamic_blob) = row;
        let base = Embedding::from_raw(self.decrypt_embedding(&base_blob)?)?;
        let dynamic = match dynamic_blob {
            Some(blob) => Some(Embedding::from_raw(self.decrypt_embedding(&blob)?)?),
            None => None,
        };
        Ok(IdentityRecord {
            meta: IdentityMeta {
                id,
                name,
                default_shift,
            },
            base,
            dynamic,
        })
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an embedding blob (legacy plaintext or nonce-prefixed AES-GCM).
    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() == EMBEDDING_BYTE_LEN {
            return bytes_to_embedding_strict(blob);
        }

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext)
    }
}

// ── Row helpers (run inside the connection thread) ───────────────────────────

fn read_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn identity_exists(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM identities WHERE id = ?1", [id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
}

fn last_timestamp_text(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT timestamp FROM logs WHERE identity_id = ?1 ORDER BY timestamp DESC LIMIT 1",
        [id],
        |row| row.get(0),
    )
    .optional()
}

fn insert_log(conn: &rusqlite::Connection, event: &AttendanceEvent) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO logs (identity_id, timestamp, confidence, base_score, dynamic_score, evidence_ref)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            event.identity_id,
            format_timestamp(&event.timestamp),
            event.confidence as f64,
            event.base_score as f64,
            event.dynamic_score as f64,
            event.evidence_ref,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| StoreError::InvalidTimestamp(text.to_string()))
}

fn now_text() -> String {
    format_timestamp(&chrono::Local::now().naive_local())
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }
    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn unit(seed: usize) -> Embedding {
        let values = (0..EMBEDDING_DIM)
            .map(|i| ((i * 31 + seed * 17) % 97) as f32 / 97.0 + 0.01)
            .collect();
        Embedding::from_raw(values).unwrap()
    }

    pub(crate) fn meta(id: &str, name: &str) -> IdentityMeta {
        IdentityMeta {
            id: id.into(),
            name: name.into(),
            default_shift: None,
        }
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn event(id: &str, ts: &str) -> AttendanceEvent {
        AttendanceEvent {
            identity_id: id.into(),
            timestamp: at(ts),
            confidence: 0.9,
            base_score: 0.8,
            dynamic_score: 0.7,
            evidence_ref: None,
        }
    }

    async fn memory_store() -> IdentityStore {
        IdentityStore::open(Path::new(":memory:")).await.unwrap()
    }

    /// Drop the identities table so every identity query fails.
    pub(crate) async fn break_identities(store: &IdentityStore) {
        store
            .conn
            .call(|conn| {
                conn.execute_batch("PRAGMA foreign_keys = OFF; DROP TABLE identities;")?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_reports_unusable_directory() {
        let blocker = std::env::temp_dir().join(format!("evofaced-store-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        let err = IdentityStore::open(&blocker.join("attendance.db")).await.err();
        assert!(
            matches!(err, Some(StoreError::CreateDir { ref path, .. }) if path == &blocker),
            "{err:?}"
        );
        std::fs::remove_file(&blocker).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debounced_appends_admit_one() {
        let store = memory_store().await;
        store.register_identity(&meta("e01", "Alice"), &unit(1)).await.unwrap();
        let window = chrono::Duration::minutes(5);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .append_log_debounced(&event("e01", "2024-01-10 09:00:00"), window)
                    .await
                    .unwrap()
            });
        }
        let mut accepted = 0;
        let mut debounced = 0;
        while let Some(outcome) = tasks.join_next().await {
            match outcome.unwrap() {
                AppendOutcome::Inserted { .. } => accepted += 1,
                AppendOutcome::Debounced { remaining_secs } => {
                    assert_eq!(remaining_secs, 300);
                    debounced += 1;
                }
            }
        }
        assert_eq!((accepted, debounced), (1, 7));
        assert_eq!(store.recent_logs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_count_fails_without_schema() {
        let store = memory_store().await;
        break_identities(&store).await;
        assert!(store.count_identities().await.is_err());
    }

    #[tokio::test]
    async fn test_register_and_load_roundtrip() {
        let store = memory_store().await;
        let base = unit(1);
        store.register_identity(&meta("e01", "Alice"), &base).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].meta.id, "e01");
        assert_eq!(all[0].meta.name, "Alice");
        assert!(all[0].dynamic.is_none());
        for (a, b) in all[0].base.as_slice().iter().zip(base.as_slice()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(store.count_identities().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reregister_clears_dynamic_keeps_logs() {
        let store = memory_store().await;
        store.register_identity(&meta("e01", "Alice"), &unit(1)).await.unwrap();
        assert!(store.update_dynamic("e01", &unit(2)).await.unwrap());
        store.append_log(&event("e01", "2024-01-10 09:00:00")).await.unwrap();

        store.register_identity(&meta("e01", "Alice B."), &unit(3)).await.unwrap();
        let rec = store.get_identity("e01").await.unwrap().unwrap();
        assert_eq!(rec.meta.name, "Alice B.");
        assert!(rec.dynamic.is_none());
        assert_eq!(store.recent_logs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_dynamic_persists() {
        let store = memory_store().await;
        store.register_identity(&meta("e01", "Alice"), &unit(1)).await.unwrap();
        let dynamic = unit(5);
        assert!(store.update_dynamic("e01", &dynamic).await.unwrap());
        assert!(!store.update_dynamic("ghost", &dynamic).await.unwrap());

        let rec = store.get_identity("e01").await.unwrap().unwrap();
        let stored = rec.dynamic.unwrap();
        assert!((stored.similarity(&dynamic) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_remove_cascades_logs() {
        let store = memory_store().await;
        store.register_identity(&meta("e01", "Alice"), &unit(1)).await.unwrap();
        store.register_identity(&meta("e02", "Bob"), &unit(2)).await.unwrap();
        store.append_log(&event("e01", "2024-01-10 09:00:00")).await.unwrap();
        store.append_log(&event("e02", "2024-01-10 09:01:00")).await.unwrap();

        assert!(store.remove_identity("e01").await.unwrap());
        assert!(!store.remove_identity("e01").await.unwrap());
        let logs = store.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].identity_id, "e02");
        assert_eq!(logs[0].name, "Bob");
        assert!(store.get_identity("e01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_debounced_append() {
        let store = memory_store().await;
        store.register_identity(&meta("e01", "Alice"), &unit(1)).await.unwrap();
        let window = chrono::Duration::minutes(1);

        let first = store
            .append_log_debounced(&event("e01", "2024-01-10 09:00:00"), window)
            .await
            .unwrap();
        assert!(matches!(first, AppendOutcome::Inserted { .. }));

        let second = store
            .append_log_debounced(&event("e01", "2024-01-10 09:00:30"), window)
            .await
            .unwrap();
        assert_eq!(second, AppendOutcome::Debounced { remaining_secs: 30 });

        let third = store
            .append_log_debounced(&event("e01", "2024-01-10 09:01:00"), window)
            .await
            .unwrap();
        assert!(matches!(third, AppendOutcome::Inserted { .. }));

        let logs = store.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(parse_timestamp(&logs[0].timestamp).unwrap(), at("2024-01-10 09:01:00"));
    }

    #[tokio::test]
    async fn test_append_unknown_identity() {
        let store = memory_store().await;
        let err = store.append_log(&event("ghost", "2024-01-10 09:00:00")).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownIdentity(_)));
        let err = store
            .append_log_debounced(&event("ghost", "2024-01-10 09:00:00"), chrono::Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownIdentity(_)));
    }

    #[tokio::test]
    async fn test_recent_logs_newest_first_and_limited() {
        let store = memory_store().await;
        store.register_identity(&meta("e01", "Alice"), &unit(1)).await.unwrap();
        for ts in ["2024-01-10 09:00:00", "2024-01-12 09:00:00", "2024-01-11 09:00:00"] {
            store.append_log(&event("e01", ts)).await.unwrap();
        }
        let logs = store.recent_logs(2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].timestamp, "2024-01-12 09:00:00.000000");
        assert_eq!(logs[1].timestamp, "2024-01-11 09:00:00.000000");
    }

    #[tokio::test]
    async fn test_embedding_byte_fidelity() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[0] = 0.0;
        values[1] = -0.0;
        values[2] = 1.0;
        values[3] = -1.0;
        values[4] = f32::MIN_POSITIVE;
        values[5] = f32::EPSILON;
        values[6] = std::f32::consts::PI;

        let bytes = embedding_to_bytes(&values);
        let recovered = bytes_to_embedding_strict(&bytes).unwrap();
        for (orig, rec) in values.iter().zip(recovered.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits(), "mismatch: {orig} vs {rec}");
        }
    }

    #[tokio::test]
    async fn test_strict_rejects_non_finite_and_wrong_length() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[42] = f32::NAN;
        let err = bytes_to_embedding_strict(&embedding_to_bytes(&values)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));

        let err = bytes_to_embedding_strict(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(100)));

        let err = validate_embedding_values(&[0.5f32; 256]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingDim(256)));
    }

    #[tokio::test]
    async fn test_legacy_plaintext_blob_accepted() {
        let store = memory_store().await;
        let values: Vec<f32> = unit(9).into_vec();
        let decoded = store.decrypt_embedding(&embedding_to_bytes(&values)).unwrap();
        assert_eq!(decoded, values);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let store1 = IdentityStore {
            conn: tokio_rusqlite::Connection::open(Path::new(":memory:"))
                .await
                .unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = IdentityStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let blob = store1.encrypt_embedding(unit(1).as_slice()).unwrap();
        assert_ne!(blob.len(), EMBEDDING_BYTE_LEN);
        assert!(store2.decrypt_embedding(&blob).is_err());
        assert!(store1.decrypt_embedding(&blob).is_ok());
    }

    #[test]
    fn test_timestamp_text_orders_like_time() {
        let a = format_timestamp(&at("2024-01-10 09:00:00"));
        let b = format_timestamp(&(at("2024-01-10 09:00:00") + chrono::Duration::microseconds(5)));
        let c = format_timestamp(&at("2024-01-10 10:00:00"));
        assert!(a < b && b < c);
        assert_eq!(parse_timestamp(&b).unwrap(), at("2024-01-10 09:00:00") + chrono::Duration::microseconds(5));
        assert_eq!(parse_timestamp("2024-01-10 09:00:00").unwrap(), at("2024-01-10 09:00:00"));
    }
}
