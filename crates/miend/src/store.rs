//! Member face store.
//!
//! One row per member — re-enrollment overwrites the previous descriptor.
//! Descriptor blobs are sealed with AES-256-GCM before they touch disk;
//! the key lives next to the database and is created 0600 on first run.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::Utc;
use mien_core::types::DescriptorDimError;
use mien_core::{FaceDescriptor, MemberFace};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sealed descriptor rejected: {0}")]
    Crypto(String),
    #[error("stored descriptor invalid: {0}")]
    BadDescriptor(#[from] DescriptorDimError),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Listing row for the admin surface; descriptors stay sealed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FaceSummary {
    pub member: String,
    pub label: String,
    pub created_at: String,
}

/// SQLite-backed store of enrolled member faces.
#[derive(Clone)]
pub struct FaceStore {
    conn: tokio_rusqlite::Connection,
    cipher: Aes256Gcm,
}

impl FaceStore {
    /// Open (creating if needed) the database and encryption key.
    pub async fn open(db_path: &Path, key_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let key = load_or_create_key(key_path)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        let conn = tokio_rusqlite::Connection::open(db_path.to_path_buf()).await?;
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS member_faces (
                     member     TEXT PRIMARY KEY,
                     id         TEXT NOT NULL,
                     label      TEXT NOT NULL,
                     descriptor BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 )",
                [],
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(db = %db_path.display(), "face store opened");

        Ok(Self { conn, cipher })
    }

    /// Persist a descriptor for a member, replacing any previous enrollment.
    pub async fn save_face(
        &self,
        member: &str,
        label: &str,
        descriptor: &FaceDescriptor,
    ) -> Result<MemberFace, StoreError> {
        let record = MemberFace {
            id: Uuid::new_v4().to_string(),
            member: member.to_string(),
            label: label.to_string(),
            descriptor: descriptor.clone(),
            created_at: Utc::now().to_rfc3339(),
        };

        let blob = seal(&self.cipher, &serde_json::to_vec(descriptor.as_slice())?)?;

        let row = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO member_faces (member, id, label, descriptor, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(member) DO UPDATE
                     SET id = ?2, label = ?3, descriptor = ?4, created_at = ?5",
                    rusqlite::params![row.member, row.id, row.label, blob, row.created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(member, label, id = %record.id, "face enrolled");
        Ok(record)
    }

    /// Fetch a member's enrolled face, if any.
    pub async fn get_face(&self, member: &str) -> Result<Option<MemberFace>, StoreError> {
        let member_key = member.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, descriptor, created_at
                     FROM member_faces WHERE member = ?1",
                )?;
                let mut rows = stmt.query([member_key])?;
                match rows.next()? {
                    Some(row) => Ok(Some((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                    ))),
                    None => Ok(None),
                }
            })
            .await?;

        let Some((id, label, blob, created_at)) = row else {
            return Ok(None);
        };

        let plain = open_sealed(&self.cipher, &blob)?;
        let values: Vec<f32> = serde_json::from_slice(&plain)?;

        Ok(Some(MemberFace {
            id,
            member: member.to_string(),
            label,
            descriptor: FaceDescriptor::new(values)?,
            created_at,
        }))
    }

    /// Remove a member's enrollment. Returns false when nothing was stored.
    pub async fn remove_face(&self, member: &str) -> Result<bool, StoreError> {
        let member_key = member.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM member_faces WHERE member = ?1",
                    [member_key],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    /// All enrollments, without descriptors.
    pub async fn list(&self) -> Result<Vec<FaceSummary>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT member, label, created_at FROM member_faces ORDER BY member",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(FaceSummary {
                            member: row.get(0)?,
                            label: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

/// Read the key file, or generate a fresh 32-byte key with 0600 permissions.
fn load_or_create_key(key_path: &Path) -> Result<[u8; KEY_LEN], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path)?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| StoreError::Crypto(format!("key file {} is not {KEY_LEN} bytes", key_path.display())))?;
        return Ok(key);
    }

    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    std::fs::write(key_path, key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %key_path.display(), "created descriptor encryption key");
    Ok(key)
}

/// Encrypt with a random nonce prepended to the ciphertext.
fn seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| StoreError::Crypto(e.to_string()))?;

    let mut sealed = nonce.to_vec();
    sealed.extend(ciphertext);
    Ok(sealed)
}

fn open_sealed(cipher: &Aes256Gcm, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
    if sealed.len() <= NONCE_LEN {
        return Err(StoreError::Crypto("sealed blob too short".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| StoreError::Crypto(e.to_string()))
}
