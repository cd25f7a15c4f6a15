//! Local read cache of canonical entities, backed by SQLite.
//!
//! Rows are replaced by key on every sync, never merged. The key includes
//! the storage kind and the attachment parent type, so attachments sharing
//! an id across parent kinds do not collide.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::catalog::ResourceType;
use crate::mapper::{to_canonical, CanonicalEntity, RawRecord, StorageKind};

/// Entity store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE entities (
///     owner TEXT NOT NULL,
///     grp TEXT NOT NULL,
///     collection TEXT NOT NULL,     -- storage kind
///     parent_type TEXT NOT NULL,    -- '' unless an attachment
///     id TEXT NOT NULL,
///     entity_type TEXT NOT NULL,
///     name TEXT NOT NULL,
///     parent_id TEXT,
///     body TEXT NOT NULL,           -- CanonicalEntity as JSON
///     updated_at TEXT NOT NULL,
///     PRIMARY KEY (owner, grp, collection, parent_type, id)
/// );
/// ```
pub struct EntityStore {
    conn: Mutex<Connection>,
}

const SELECT_BODY: &str = "SELECT body FROM entities";

impl EntityStore {
    /// Opens (or creates) the database and ensures the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open entity store at {}", path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                owner       TEXT NOT NULL,
                grp         TEXT NOT NULL,
                collection  TEXT NOT NULL,
                parent_type TEXT NOT NULL,
                id          TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                name        TEXT NOT NULL,
                parent_id   TEXT,
                body        TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (owner, grp, collection, parent_type, id)
            );
            CREATE INDEX IF NOT EXISTS idx_entities_parent
                ON entities(owner, grp, collection, parent_id);",
        )
        .context("Failed to create entities table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Maps `raw_records` and replaces any stored row with the same key.
    ///
    /// # Returns
    /// * Number of entities written
    pub fn store(
        &self,
        resource: ResourceType,
        raw_records: &[RawRecord],
        owner: &str,
        parent_id: Option<&str>,
        group: &str,
    ) -> Result<usize> {
        self.store_mapped(resource, raw_records, owner, parent_id, group)
            .map(|entities| entities.len())
    }

    /// Same as [`EntityStore::store`] but hands back the written entities.
    pub fn store_mapped(
        &self,
        resource: ResourceType,
        raw_records: &[RawRecord],
        owner: &str,
        parent_id: Option<&str>,
        group: &str,
    ) -> Result<Vec<CanonicalEntity>> {
        let entities: Vec<CanonicalEntity> = raw_records
            .iter()
            .map(|raw| {
                let mut entity = to_canonical(resource, raw, owner, parent_id);
                entity.group = group.to_string();
                entity
            })
            .collect();

        self.upsert_entities(&entities)?;
        Ok(entities)
    }

    /// Writes all entities in one transaction.
    pub fn upsert_entities(&self, entities: &[CanonicalEntity]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().context("Failed to begin transaction")?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO entities (
                        owner, grp, collection, parent_type, id,
                        entity_type, name, parent_id, body, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ON CONFLICT(owner, grp, collection, parent_type, id) DO UPDATE SET
                        entity_type = excluded.entity_type,
                        name = excluded.name,
                        parent_id = excluded.parent_id,
                        body = excluded.body,
                        updated_at = excluded.updated_at",
                )
                .context("Failed to prepare upsert")?;

            let now = Utc::now().to_rfc3339();
            for entity in entities {
                let body = serde_json::to_string(entity)
                    .with_context(|| format!("Failed to serialize entity {}", entity.id))?;
                stmt.execute(params![
                    entity.owner,
                    entity.group,
                    entity.storage_kind.as_str(),
                    entity.parent_type.as_deref().unwrap_or_default(),
                    entity.id,
                    entity.entity_type,
                    entity.name,
                    entity.parent_id,
                    body,
                    now,
                ])
                .with_context(|| format!("Failed to upsert entity {}", entity.id))?;
            }
        }

        tx.commit().context("Failed to commit entities")?;
        debug!(count = entities.len(), "Entities upserted");
        Ok(entities.len())
    }

    pub fn upsert_entity(&self, entity: &CanonicalEntity) -> Result<()> {
        self.upsert_entities(std::slice::from_ref(entity)).map(|_| ())
    }

    /// Looks up one entity by id.
    pub fn get(
        &self,
        owner: &str,
        group: &str,
        kind: StorageKind,
        id: &str,
    ) -> Result<Option<CanonicalEntity>> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                &format!(
                    "{} WHERE owner = ?1 AND grp = ?2 AND collection = ?3 AND id = ?4
                     ORDER BY parent_type LIMIT 1",
                    SELECT_BODY
                ),
                params![owner, group, kind.as_str(), id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query entity")?;

        body.map(|b| decode(&b)).transpose()
    }

    /// Finds an attachment by id whatever its parent kind.
    pub fn find_attachment(
        &self,
        owner: &str,
        group: &str,
        id: &str,
    ) -> Result<Option<CanonicalEntity>> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                &format!(
                    "{} WHERE owner = ?1 AND grp = ?2 AND entity_type = ?3 AND id = ?4 LIMIT 1",
                    SELECT_BODY
                ),
                params![owner, group, ResourceType::Attachments.as_str(), id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query attachment")?;

        body.map(|b| decode(&b)).transpose()
    }

    /// Every entity of a kind, in first-stored order.
    pub fn list(
        &self,
        owner: &str,
        group: &str,
        kind: StorageKind,
    ) -> Result<Vec<CanonicalEntity>> {
        self.query_bodies(
            "WHERE owner = ?1 AND grp = ?2 AND collection = ?3",
            params![owner, group, kind.as_str()],
        )
    }

    /// Entities of a kind whose `parent_id` is `parent_id`.
    pub fn children(
        &self,
        owner: &str,
        group: &str,
        kind: StorageKind,
        parent_id: &str,
    ) -> Result<Vec<CanonicalEntity>> {
        self.query_bodies(
            "WHERE owner = ?1 AND grp = ?2 AND collection = ?3 AND parent_id = ?4",
            params![owner, group, kind.as_str(), parent_id],
        )
    }

    /// Attachments hanging off one parent entity.
    pub fn attachments_for(
        &self,
        owner: &str,
        group: &str,
        parent_type: &str,
        parent_id: &str,
    ) -> Result<Vec<CanonicalEntity>> {
        let kind = StorageKind::for_entity(ResourceType::Attachments, Some(parent_type));
        self.query_bodies(
            "WHERE owner = ?1 AND grp = ?2 AND collection = ?3 \
             AND parent_type = ?4 AND parent_id = ?5",
            params![owner, group, kind.as_str(), parent_type, parent_id],
        )
    }

    pub fn count(&self, owner: &str, group: &str, kind: StorageKind) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entities WHERE owner = ?1 AND grp = ?2 AND collection = ?3",
                params![owner, group, kind.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count entities")?;
        Ok(count as usize)
    }

    /// Administrative bulk clean of one owner's group. Returns rows removed.
    pub fn purge_group(&self, owner: &str, group: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "DELETE FROM entities WHERE owner = ?1 AND grp = ?2",
                params![owner, group],
            )
            .context("Failed to purge group")?;
        Ok(removed)
    }

    fn query_bodies(
        &self,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<CanonicalEntity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("{} {} ORDER BY rowid", SELECT_BODY, filter))
            .context("Failed to prepare entity query")?;

        let bodies = stmt
            .query_map(args, |row| row.get::<_, String>(0))
            .context("Failed to query entities")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read entity rows")?;

        bodies.iter().map(|b| decode(b)).collect()
    }
}

fn decode(body: &str) -> Result<CanonicalEntity> {
    serde_json::from_str(body).context("Failed to decode stored entity")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EntityStore {
        EntityStore::new(":memory:").expect("in-memory store failed")
    }

    fn test_record(id: &str, name: &str) -> RawRecord {
        RawRecord::new()
            .with("id", Some(id))
            .with("name", Some(name))
            .with("status", Some("Ready"))
    }

    fn attachment(id: &str, parent_type: &str) -> RawRecord {
        RawRecord::new()
            .with("id", Some(id))
            .with("name", Some("screenshot.png"))
            .with("parent-type", Some(parent_type))
    }

    #[test]
    fn test_store_and_read_back() {
        let store = store();
        let records = vec![test_record("1", "Login"), test_record("2", "Logout")];

        let count = store
            .store(ResourceType::Tests, &records, "alice", Some("10"), "default")
            .unwrap();
        assert_eq!(count, 2);

        let entity = store
            .get("alice", "default", StorageKind::TestplanTests, "2")
            .unwrap()
            .expect("entity stored");
        assert_eq!(entity.name, "Logout");
        assert_eq!(entity.group, "default");
        assert_eq!(entity.parent_id.as_deref(), Some("10"));
        assert_eq!(entity.field("status"), Some("Ready"));
    }

    #[test]
    fn test_store_is_idempotent() {
        let store = store();
        let records = vec![test_record("1", "Login"), test_record("2", "Logout")];

        store.store(ResourceType::Tests, &records, "alice", Some("10"), "g").unwrap();
        let first = store.list("alice", "g", StorageKind::TestplanTests).unwrap();
        store.store(ResourceType::Tests, &records, "alice", Some("10"), "g").unwrap();
        let second = store.list("alice", "g", StorageKind::TestplanTests).unwrap();

        assert_eq!(store.count("alice", "g", StorageKind::TestplanTests).unwrap(), 2);
        let strip = |entities: Vec<CanonicalEntity>| {
            entities
                .into_iter()
                .map(|mut e| {
                    e.synced_at = chrono::DateTime::<Utc>::MIN_UTC;
                    e
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(first), strip(second));
    }

    #[test]
    fn test_resync_replaces_rather_than_merges() {
        let store = store();
        let original = test_record("1", "Login");
        store.store(ResourceType::Tests, &[original], "alice", None, "g").unwrap();

        let edited = RawRecord::new().with("id", Some("1")).with("name", Some("Sign in"));
        store.store(ResourceType::Tests, &[edited], "alice", None, "g").unwrap();

        let entity = store.get("alice", "g", StorageKind::TestplanTests, "1").unwrap().unwrap();
        assert_eq!(entity.name, "Sign in");
        assert_eq!(entity.field("status"), None);
    }

    #[test]
    fn test_attachments_with_same_id_stay_distinct() {
        let store = store();
        for parent_type in ["test", "defect"] {
            store
                .store(
                    ResourceType::Attachments,
                    &[attachment("5", parent_type)],
                    "alice",
                    Some("100"),
                    "g",
                )
                .unwrap();
        }

        let on_test = store.attachments_for("alice", "g", "test", "100").unwrap();
        let on_defect = store.attachments_for("alice", "g", "defect", "100").unwrap();
        assert_eq!(on_test.len(), 1);
        assert_eq!(on_defect.len(), 1);
        assert_eq!(on_test[0].storage_kind, StorageKind::TestplanTestAttachments);
        assert_eq!(on_defect[0].storage_kind, StorageKind::DefectAttachments);

        let found = store.find_attachment("alice", "g", "5").unwrap().expect("attachment");
        assert_eq!(found.name, "screenshot.png");
        assert!(store.find_attachment("alice", "g", "6").unwrap().is_none());
    }

    #[test]
    fn test_generic_attachments_keyed_by_parent_type() {
        let store = store();
        store
            .store(
                ResourceType::Attachments,
                &[attachment("9", "requirement"), attachment("9", "release")],
                "alice",
                Some("1"),
                "g",
            )
            .unwrap();

        assert_eq!(store.count("alice", "g", StorageKind::Attachments).unwrap(), 2);
    }

    #[test]
    fn test_children_and_owner_isolation() {
        let store = store();
        store
            .store(ResourceType::Tests, &[test_record("1", "a")], "alice", Some("10"), "g")
            .unwrap();
        store
            .store(ResourceType::Tests, &[test_record("2", "b")], "alice", Some("11"), "g")
            .unwrap();
        store
            .store(ResourceType::Tests, &[test_record("1", "a")], "bob", Some("10"), "g")
            .unwrap();

        let children = store.children("alice", "g", StorageKind::TestplanTests, "10").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "1");
        assert_eq!(store.count("bob", "g", StorageKind::TestplanTests).unwrap(), 1);
    }

    #[test]
    fn test_purge_group() {
        let store = store();
        store
            .store(ResourceType::Tests, &[test_record("1", "a")], "alice", None, "g1")
            .unwrap();
        store
            .store(ResourceType::Tests, &[test_record("1", "a")], "alice", None, "g2")
            .unwrap();

        assert_eq!(store.purge_group("alice", "g1").unwrap(), 1);
        assert_eq!(store.count("alice", "g1", StorageKind::TestplanTests).unwrap(), 0);
        assert_eq!(store.count("alice", "g2", StorageKind::TestplanTests).unwrap(), 1);
    }

    #[test]
    fn test_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        EntityStore::new(&path)
            .unwrap()
            .store(ResourceType::Defects, &[test_record("3", "Crash")], "alice", None, "g")
            .unwrap();

        let reopened = EntityStore::new(&path).unwrap();
        assert!(reopened.get("alice", "g", StorageKind::Defects, "3").unwrap().is_some());
    }
}
