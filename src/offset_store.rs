//! Durable `(taskId, instanceId) -> OffsetRecord` mapping (spec §4.1),
//! backed by a `sled` tree keyed exactly as the spec describes so the
//! on-disk layout is legible with any generic KV browser.

use chrono::Utc;
use tracing::warn;

use crate::error::Result;
use crate::model::OffsetRecord;

fn offset_key(task_id: &str, instance_id: &str) -> String {
    format!("offset:{task_id}_{instance_id}")
}

#[derive(Clone)]
pub struct OffsetStore {
    tree: sled::Tree,
}

impl OffsetStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree("offsets")?;
        Ok(Self { tree })
    }

    /// Stamps `last_update_time` and writes the record. Silently rejected
    /// (logged, not an error) if required fields are missing.
    pub fn put(&self, mut record: OffsetRecord) -> Result<()> {
        if !record.is_well_formed() {
            warn!(
                task_id = %record.task_id,
                instance_id = %record.instance_id,
                "rejecting offset record with missing required fields"
            );
            return Ok(());
        }
        record.last_update_time = Utc::now();
        let key = offset_key(&record.task_id, &record.instance_id);
        let value = serde_json::to_vec(&record)?;
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get(&self, task_id: &str, instance_id: &str) -> Result<Option<OffsetRecord>> {
        let key = offset_key(task_id, instance_id);
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, task_id: &str, instance_id: &str) -> Result<()> {
        let key = offset_key(task_id, instance_id);
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<OffsetRecord>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            match serde_json::from_slice::<OffsetRecord>(&value) {
                Ok(record) => out.push(record),
                Err(err) => warn!(%err, "skipping unreadable offset record"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, sled::Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let (_dir, db) = open_temp();
        let store = OffsetStore::open(&db).unwrap();
        let record = OffsetRecord {
            task_id: "t1".into(),
            instance_id: "i1".into(),
            offset: "100".into(),
            inode: 42,
            last_update_time: Utc::now(),
        };
        store.put(record.clone()).unwrap();
        let fetched = store.get("t1", "i1").unwrap().unwrap();
        assert_eq!(fetched.offset, "100");
        store.delete("t1", "i1").unwrap();
        assert!(store.get("t1", "i1").unwrap().is_none());
    }

    #[test]
    fn put_rejects_missing_fields() {
        let (_dir, db) = open_temp();
        let store = OffsetStore::open(&db).unwrap();
        let record = OffsetRecord {
            task_id: "t1".into(),
            instance_id: String::new(),
            offset: "100".into(),
            inode: 0,
            last_update_time: Utc::now(),
        };
        store.put(record).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn list_returns_all_records() {
        let (_dir, db) = open_temp();
        let store = OffsetStore::open(&db).unwrap();
        for i in 0..3 {
            store
                .put(OffsetRecord {
                    task_id: "t1".into(),
                    instance_id: format!("i{i}"),
                    offset: "1".into(),
                    inode: 0,
                    last_update_time: Utc::now(),
                })
                .unwrap();
        }
        assert_eq!(store.list().unwrap().len(), 3);
    }
}
