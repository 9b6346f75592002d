//! Durable `(taskId, instanceId) -> InstanceProfile` mapping (spec §4.2).
//! Crash-consistent: a surviving process observes exactly the last
//! successful `store`/`delete` for each key, which `sled`'s log-structured
//! store gives us for free.

use tracing::warn;

use crate::error::Result;
use crate::model::InstanceProfile;

fn instance_key(task_id: &str, instance_id: &str) -> String {
    format!("instance:{task_id}:{instance_id}")
}

fn task_prefix(task_id: &str) -> String {
    format!("instance:{task_id}:")
}

#[derive(Clone)]
pub struct InstanceStore {
    tree: sled::Tree,
}

impl InstanceStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree("instances")?;
        Ok(Self { tree })
    }

    pub fn store(&self, profile: &InstanceProfile) -> Result<()> {
        let key = instance_key(&profile.task_id, &profile.instance_id);
        let value = serde_json::to_vec(profile)?;
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get(&self, task_id: &str, instance_id: &str) -> Result<Option<InstanceProfile>> {
        let key = instance_key(task_id, instance_id);
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, task_id: &str, instance_id: &str) -> Result<()> {
        let key = instance_key(task_id, instance_id);
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn list(&self, task_id: &str) -> Result<Vec<InstanceProfile>> {
        let prefix = task_prefix(task_id);
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            match serde_json::from_slice::<InstanceProfile>(&value) {
                Ok(profile) => out.push(profile),
                Err(err) => warn!(%err, "skipping unreadable instance profile"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceState;

    fn open_temp() -> (tempfile::TempDir, sled::Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn store_get_delete_roundtrip() {
        let (_dir, db) = open_temp();
        let store = InstanceStore::open(&db).unwrap();
        let profile = InstanceProfile::new("t1", "i1", "file", "proxy");
        store.store(&profile).unwrap();
        let fetched = store.get("t1", "i1").unwrap().unwrap();
        assert_eq!(fetched.instance_id, "i1");
        store.delete("t1", "i1").unwrap();
        assert!(store.get("t1", "i1").unwrap().is_none());
    }

    #[test]
    fn list_is_scoped_to_task() {
        let (_dir, db) = open_temp();
        let store = InstanceStore::open(&db).unwrap();
        store
            .store(&InstanceProfile::new("t1", "i1", "file", "proxy"))
            .unwrap();
        store
            .store(&InstanceProfile::new("t2", "i1", "file", "proxy"))
            .unwrap();
        let listed = store.list("t1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, "t1");
    }

    #[test]
    fn last_write_wins() {
        let (_dir, db) = open_temp();
        let store = InstanceStore::open(&db).unwrap();
        let mut profile = InstanceProfile::new("t1", "i1", "file", "proxy");
        store.store(&profile).unwrap();
        profile.state = InstanceState::Finished;
        store.store(&profile).unwrap();
        let fetched = store.get("t1", "i1").unwrap().unwrap();
        assert_eq!(fetched.state, InstanceState::Finished);
    }
}
