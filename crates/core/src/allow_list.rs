//! Admin set plus runtime allow-list, backed by a durable JSON snapshot.
//!
//! The admin set is read once at boot and frozen; it is never written back.
//! Only entries added at runtime (`added_by` not `"config"`) are persisted —
//! admins and config-seeded users are rehydrated from configuration on every
//! boot, so the snapshot never needs to carry them.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The literal `added_by` value for users seeded from configuration.
pub const CONFIG_SEEDED: &str = "config";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedUser {
    pub user_id: String,
    pub added_at: u64,
    pub added_by: String,
}

pub struct AllowList {
    admins: HashSet<String>,
    users: DashMap<String, AllowedUser, ahash::RandomState>,
    data_path: PathBuf,
    write_lock: Mutex<()>,
}

impl AllowList {
    /// Builds the allow-list at boot: admins ∪ initial allow-list ∪ the
    /// durable snapshot (if present). File I/O errors while reading the
    /// snapshot are logged and treated as "no prior snapshot" — in-memory
    /// state is authoritative at runtime, so a corrupt/missing file never
    /// blocks startup.
    pub fn load(admins: Vec<String>, initial_users: Vec<String>, data_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(data_dir)?;
        let data_path = data_dir.join("allow_list.json");

        let admins: HashSet<String> = admins.into_iter().collect();
        let users = DashMap::with_hasher(ahash::RandomState::new());
        let now = now_unix();

        for user_id in &admins {
            users.insert(
                user_id.clone(),
                AllowedUser { user_id: user_id.clone(), added_at: now, added_by: CONFIG_SEEDED.to_string() },
            );
        }
        for user_id in initial_users {
            users.entry(user_id.clone()).or_insert(AllowedUser {
                user_id,
                added_at: now,
                added_by: CONFIG_SEEDED.to_string(),
            });
        }

        match fs::read_to_string(&data_path) {
            Ok(raw) => match serde_json::from_str::<Vec<AllowedUser>>(&raw) {
                Ok(persisted) => {
                    for entry in persisted {
                        users.insert(entry.user_id.clone(), entry);
                    }
                }
                Err(err) => log::warn!("allow-list snapshot at {data_path:?} is corrupt, ignoring: {err}"),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("failed to read allow-list snapshot at {data_path:?}: {err}"),
        }

        Ok(Self { admins, users, data_path, write_lock: Mutex::new(()) })
    }

    pub fn is_allowed(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }

    /// Adds `user_id` to the allow-list on behalf of `by_admin_id`. A no-op
    /// (returns `true`) if the user is already present.
    pub fn add(&self, user_id: &str, by_admin_id: &str) -> bool {
        if self.users.contains_key(user_id) {
            return true;
        }

        self.users.insert(
            user_id.to_string(),
            AllowedUser { user_id: user_id.to_string(), added_at: now_unix(), added_by: by_admin_id.to_string() },
        );
        self.persist();
        true
    }

    /// Removes `user_id`. Refuses (returns `false`) for admins, who are
    /// implicitly on the allow-list and immutable at runtime.
    pub fn remove(&self, user_id: &str, _by_admin_id: &str) -> bool {
        if self.admins.contains(user_id) {
            log::warn!("refusing to remove admin {user_id} from the allow-list");
            return false;
        }

        let removed = self.users.remove(user_id).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn list_users(&self) -> Vec<AllowedUser> {
        self.users.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn list_admins(&self) -> Vec<String> {
        self.admins.iter().cloned().collect()
    }

    /// Rewrites the JSON snapshot with only the runtime-added entries,
    /// atomically (write-to-temp, then rename). Failures are logged and
    /// swallowed; the in-memory state remains authoritative.
    fn persist(&self) {
        let _guard = self.write_lock.lock();

        let runtime_entries: Vec<AllowedUser> = self
            .users
            .iter()
            .filter(|entry| entry.value().added_by != CONFIG_SEEDED)
            .map(|entry| entry.value().clone())
            .collect();

        let result = (|| -> io::Result<()> {
            let json = serde_json::to_vec_pretty(&runtime_entries)?;
            let tmp_path = self.data_path.with_extension("json.tmp");
            fs::write(&tmp_path, json)?;
            fs::rename(&tmp_path, &self.data_path)?;
            Ok(())
        })();

        if let Err(err) = result {
            log::error!("failed to persist allow-list snapshot at {:?}: {err}", self.data_path);
        }
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admins_are_implicitly_allowed_and_cannot_be_removed() {
        let dir = tempdir();
        let list = AllowList::load(vec!["admin-1".into()], vec![], dir.path()).unwrap();

        assert!(list.is_admin("admin-1"));
        assert!(list.is_allowed("admin-1"));
        assert!(!list.remove("admin-1", "admin-1"));
        assert!(list.is_allowed("admin-1"));
    }

    #[test]
    fn add_is_idempotent_and_remove_persists() {
        let dir = tempdir();
        let list = AllowList::load(vec![], vec![], dir.path()).unwrap();

        assert!(list.add("u1", "admin-1"));
        assert!(list.add("u1", "admin-1"));
        assert!(list.is_allowed("u1"));

        assert!(list.remove("u1", "admin-1"));
        assert!(!list.is_allowed("u1"));

        let snapshot = fs::read_to_string(dir.path().join("allow_list.json")).unwrap();
        assert_eq!(snapshot.trim(), "[]");
    }

    #[test]
    fn runtime_entries_survive_a_reload() {
        let dir = tempdir();
        {
            let list = AllowList::load(vec!["admin-1".into()], vec![], dir.path()).unwrap();
            list.add("u2", "admin-1");
        }

        let reloaded = AllowList::load(vec!["admin-1".into()], vec![], dir.path()).unwrap();
        assert!(reloaded.is_allowed("u2"));
        assert!(!reloaded.is_admin("u2"));
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("sendie-allow-list-test-{}", crate::ids::generate_token()));
            Self(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }
}
