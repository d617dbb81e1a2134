use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use presence_core::{Embedding, GalleryEntry, EMBEDDING_DIM};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed gallery store with AES-256-GCM embedding encryption.
///
/// Embeddings are encrypted before storage and decrypted on retrieval.
/// A per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600, owner-readable only).
///
/// Legacy plaintext blobs (2048 bytes) are accepted transparently on read.
#[derive(Clone)]
pub struct GalleryStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl GalleryStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/presence"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS gallery (
                     id TEXT PRIMARY KEY,
                     identity TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     model_version TEXT NOT NULL,
                     quality REAL,
                     source TEXT,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_gallery_identity ON gallery(identity);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Append a new gallery entry. Returns the generated UUID.
    pub async fn append(
        &self,
        identity: &str,
        embedding: &Embedding,
        quality: Option<f32>,
        source: Option<&str>,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let model_version = embedding
            .model_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let created_at = chrono::Utc::now().to_rfc3339();

        // Encrypt before entering the SQLite closure
        validate_embedding_values(&embedding.values)?;
        let blob = self.encrypt_embedding(&embedding.values)?;

        let id_clone = id.clone();
        let identity = identity.to_string();
        let source = source.map(str::to_string);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO gallery (id, identity, embedding, model_version, quality, source, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![id_clone, identity, blob, model_version, quality, source, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Load every gallery entry — the input to a matching snapshot build.
    ///
    /// The underlying query is retried once on a transient database error
    /// before surfacing the failure.
    pub async fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = match self.load_all_rows().await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "gallery load failed — retrying once");
                self.load_all_rows().await?
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (identity, blob, model_version, quality, source) in rows {
            let values = self.decrypt_embedding(&blob)?;
            entries.push(GalleryEntry {
                identity,
                embedding: Embedding {
                    values,
                    model_version: Some(model_version),
                },
                quality,
                source,
            });
        }
        Ok(entries)
    }

    async fn load_all_rows(
        &self,
    ) -> Result<Vec<(String, Vec<u8>, String, Option<f32>, Option<String>)>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity, embedding, model_version, quality, source
                     FROM gallery ORDER BY created_at, id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<f32>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// List gallery entries (metadata only, no embeddings), optionally
    /// filtered by identity.
    pub async fn list(&self, identity: Option<&str>) -> Result<Vec<EntryInfo>, StoreError> {
        let identity = identity.map(str::to_string);
        self.conn
            .call(move |conn| {
                let map_row = |row: &rusqlite::Row<'_>| {
                    Ok(EntryInfo {
                        id: row.get(0)?,
                        identity: row.get(1)?,
                        model_version: row.get(2)?,
                        quality: row.get(3)?,
                        source: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                };
                let rows = match identity {
                    Some(identity) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, identity, model_version, quality, source, created_at
                             FROM gallery WHERE identity = ?1 ORDER BY created_at",
                        )?;
                        let rows = stmt.query_map([&identity], map_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, identity, model_version, quality, source, created_at
                             FROM gallery ORDER BY created_at",
                        )?;
                        let rows = stmt.query_map([], map_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok(rows)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove a gallery entry by ID.
    pub async fn remove(&self, entry_id: &str) -> Result<bool, StoreError> {
        let entry_id = entry_id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM gallery WHERE id = ?1", [&entry_id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count enrolled gallery entries.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM gallery", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
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

    /// Decrypt an embedding blob.
    ///
    /// Accepts the legacy plaintext format (512 × 4 = 2048 bytes) and the
    /// current encrypted format (12-byte nonce + ciphertext + 16-byte GCM tag).
    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() == EMBEDDING_BYTE_LEN {
            // Legacy plaintext — accept transparently; re-enrolled next time
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

    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
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

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about an enrolled gallery entry (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntryInfo {
    pub id: String,
    pub identity: String,
    pub model_version: String,
    pub quality: Option<f64>,
    pub source: Option<String>,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_embedding(axis: usize) -> Embedding {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[axis] = 1.0;
        Embedding::from_raw(raw, Some("w600k_r50".to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = GalleryStore::open(Path::new(":memory:")).await.unwrap();

        let embedding = Embedding::from_raw(
            (1..=EMBEDDING_DIM).map(|i| i as f32).collect(),
            Some("w600k_r50".to_string()),
        )
        .unwrap();

        let id = store
            .append("alice", &embedding, Some(0.85), Some("kiosk-1"))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let entries = store.load_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity, "alice");
        assert_eq!(entries[0].embedding.values, embedding.values);
        assert_eq!(entries[0].quality, Some(0.85));
        assert_eq!(entries[0].source.as_deref(), Some("kiosk-1"));
        assert_eq!(
            entries[0].embedding.model_version.as_deref(),
            Some("w600k_r50")
        );
    }

    #[tokio::test]
    async fn test_optional_fields_null() {
        let store = GalleryStore::open(Path::new(":memory:")).await.unwrap();
        store
            .append("bob", &unit_embedding(0), None, None)
            .await
            .unwrap();

        let entries = store.load_all().await.unwrap();
        assert_eq!(entries[0].quality, None);
        assert_eq!(entries[0].source, None);
    }

    #[tokio::test]
    async fn test_embedding_byte_fidelity() {
        // 512-dim vector with interesting values at specific positions
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[0] = 0.0;
        values[1] = -0.0;
        values[2] = 1.0;
        values[3] = -1.0;
        values[4] = f32::MIN_POSITIVE;
        values[5] = f32::EPSILON;
        values[6] = std::f32::consts::PI;
        values[7] = 0.123456789;

        let bytes = embedding_to_bytes(&values);
        let recovered = bytes_to_embedding_strict(&bytes).unwrap();
        assert_eq!(values.len(), recovered.len());
        for (orig, rec) in values.iter().zip(recovered.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits(), "mismatch: {orig} vs {rec}");
        }
    }

    #[tokio::test]
    async fn test_strict_rejects_nan() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[42] = f32::NAN;
        let bytes = embedding_to_bytes(&values);
        let err = bytes_to_embedding_strict(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
    }

    #[tokio::test]
    async fn test_strict_rejects_wrong_length() {
        let bytes = vec![0u8; 100]; // not 2048
        let err = bytes_to_embedding_strict(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(100)));
    }

    #[tokio::test]
    async fn test_validate_rejects_wrong_dimension() {
        let values = vec![0.5f32; 256]; // not 512
        let err = validate_embedding_values(&values).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingDim(256)));
    }

    #[tokio::test]
    async fn test_encryption_roundtrip() {
        let store = GalleryStore::open(Path::new(":memory:")).await.unwrap();

        let values: Vec<f32> = (1..=EMBEDDING_DIM).map(|i| i as f32 / 512.0).collect();
        let emb = Embedding::from_raw(values, Some("w600k_r50".to_string())).unwrap();

        store.append("alice", &emb, Some(0.95), None).await.unwrap();
        let entries = store.load_all().await.unwrap();

        assert_eq!(entries.len(), 1);
        for (orig, rec) in emb.values.iter().zip(entries[0].embedding.values.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        // Encrypt with one key, try to decrypt with another — must fail
        let store1 = GalleryStore {
            conn: tokio_rusqlite::Connection::open(Path::new(":memory:"))
                .await
                .unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = GalleryStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let values: Vec<f32> = (1..=EMBEDDING_DIM).map(|i| i as f32).collect();
        let blob = store1.encrypt_embedding(&values).unwrap();
        assert!(store2.decrypt_embedding(&blob).is_err());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let store = GalleryStore::open(Path::new(":memory:")).await.unwrap();

        store
            .append("alice", &unit_embedding(0), Some(0.9), None)
            .await
            .unwrap();
        let id = store
            .append("alice", &unit_embedding(1), Some(0.8), Some("re-enroll"))
            .await
            .unwrap();
        store
            .append("bob", &unit_embedding(2), None, None)
            .await
            .unwrap();

        let alice = store.list(Some("alice")).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|e| e.identity == "alice"));

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(store.count().await.unwrap(), 3);

        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_multiple_embeddings_per_identity() {
        let store = GalleryStore::open(Path::new(":memory:")).await.unwrap();
        store
            .append("alice", &unit_embedding(0), None, None)
            .await
            .unwrap();
        store
            .append("alice", &unit_embedding(1), None, None)
            .await
            .unwrap();

        let entries = store.load_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.identity == "alice"));
    }
}
