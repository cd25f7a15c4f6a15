//! SQLite table of sealed ALM passwords, one row per owner.

use super::{CachedCredential, SealedSecret};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Credential cache backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE alm_credentials (
///     owner TEXT PRIMARY KEY,
///     ciphertext TEXT NOT NULL,
///     nonce TEXT NOT NULL,
///     created_at TEXT NOT NULL  -- RFC 3339
/// );
/// ```
///
/// Rows are stored already sealed; this type never sees plaintext.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Creates or opens a credential store at `db_path` (`":memory:"` for tests).
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credential database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS alm_credentials (
                owner TEXT PRIMARY KEY,
                ciphertext TEXT NOT NULL,
                nonce TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create alm_credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Writes the sealed secret for `owner`, replacing any earlier one.
    pub fn store(&self, owner: &str, secret: &SealedSecret) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO alm_credentials (owner, ciphertext, nonce, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(owner) DO UPDATE SET
                    ciphertext = excluded.ciphertext,
                    nonce = excluded.nonce,
                    created_at = excluded.created_at
                "#,
                params![owner, secret.ciphertext, secret.nonce, now],
            )
            .context("Failed to store credential")?;

        Ok(())
    }

    /// Reads the cached credential for `owner` without opening it.
    pub fn get(&self, owner: &str) -> Result<Option<CachedCredential>> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                "SELECT ciphertext, nonce, created_at FROM alm_credentials WHERE owner = ?1",
                params![owner],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query credential")?;

        let Some((ciphertext, nonce, created_at)) = row else {
            return Ok(None);
        };

        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse created_at timestamp")?;

        Ok(Some(CachedCredential {
            owner: owner.to_string(),
            encrypted_secret: SealedSecret { ciphertext, nonce },
            created_at,
        }))
    }

    /// Removes the credential for `owner`. Returns whether a row existed.
    pub fn delete(&self, owner: &str) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM alm_credentials WHERE owner = ?1", params![owner])
            .context("Failed to delete credential")?;

        Ok(rows_affected > 0)
    }
}
