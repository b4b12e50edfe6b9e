//! Incremental reference-entity tables
//!
//! Users, members and roles observed while formatting messages are buffered
//! in memory and merged into on-disk JSON tables at every output partition
//! boundary (and once more at session end), so a crash mid-export loses at
//! most one partition's worth of reference data.
//!
//! Merges are monotonic unions keyed by stringified id: a flush never loses
//! previously persisted entities, and newer field values supersede older
//! ones for the same id. Table writes across concurrent exports sharing an
//! output directory are serialized by a process-global lock per table file.

use crate::error::Result;
use crate::types::{Member, Role, Snowflake, User};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tokio::sync::Mutex;

/// Which tables a session writes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceMode {
    /// Direct-message sessions have no members or roles; only `users.json`
    DirectMessages,
    /// Guild sessions write `members.json` and `roles.json`, with
    /// `users.json` as the fallback bucket for users without member data
    Guild,
}

/// On-disk user entry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    discriminator: Option<String>,
    display_name: String,
    is_bot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_url: Option<String>,
}

impl UserRecord {
    fn from_user(user: &User) -> Self {
        Self {
            id: user.id.to_string(),
            name: user.name.clone(),
            discriminator: user.discriminator.map(|d| format!("{d:04}")),
            display_name: user.display_name.clone(),
            is_bot: user.is_bot,
            avatar_url: user.avatar_url.clone(),
        }
    }
}

/// On-disk member entry: the user's fields plus their role references
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberRecord {
    #[serde(flatten)]
    user: UserRecord,
    role_ids: Vec<String>,
}

/// On-disk role entry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleRecord {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<String>,
    position: i64,
}

/// Entities tracked since the last flush
#[derive(Default)]
struct Pending {
    users: HashMap<Snowflake, UserRecord>,
    members: HashMap<Snowflake, MemberRecord>,
    roles: HashMap<Snowflake, RoleRecord>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.users.is_empty() && self.members.is_empty() && self.roles.is_empty()
    }
}

/// Merge-writer for the per-export-directory reference tables
pub struct ReferenceWriter {
    dir: PathBuf,
    mode: ReferenceMode,
    pending: Mutex<Pending>,
}

impl ReferenceWriter {
    /// Create a writer for one session, rooted at the export output directory
    pub fn new(dir: PathBuf, mode: ReferenceMode) -> Self {
        Self {
            dir,
            mode,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Record a user observed while formatting messages.
    ///
    /// When the session context knows richer member data for the id, the
    /// member (and its resolved roles) is recorded instead; member data
    /// supersedes the bare user record.
    pub async fn track(&self, user: &User, member: Option<&Member>, roles: &[Role]) {
        let mut pending = self.pending.lock().await;
        match (self.mode, member) {
            (ReferenceMode::Guild, Some(member)) => {
                pending.members.insert(
                    user.id,
                    MemberRecord {
                        user: UserRecord::from_user(user),
                        role_ids: member.role_ids.iter().map(Snowflake::to_string).collect(),
                    },
                );
                // Member data supersedes any bare user tracked earlier in
                // this batch
                pending.users.remove(&user.id);
                for role in roles {
                    pending.roles.insert(
                        role.id,
                        RoleRecord {
                            name: role.name.clone(),
                            color: role.color_hex(),
                            position: role.position,
                        },
                    );
                }
            }
            _ => {
                pending.users.insert(user.id, UserRecord::from_user(user));
            }
        }
    }

    /// Merge everything tracked since the last flush into the on-disk
    /// tables and clear the buffer. Flushing with nothing tracked is a
    /// no-op, so the operation is idempotent.
    pub async fn flush(&self) -> Result<()> {
        let pending = {
            let mut guard = self.pending.lock().await;
            std::mem::take(&mut *guard)
        };
        if pending.is_empty() {
            return Ok(());
        }

        match self.mode {
            ReferenceMode::DirectMessages => {
                if !pending.users.is_empty() {
                    merge_table(&self.dir.join("users.json"), to_values(&pending.users), &[])
                        .await?;
                }
            }
            ReferenceMode::Guild => {
                let members = merge_table(
                    &self.dir.join("members.json"),
                    to_values(&pending.members),
                    &[],
                )
                .await?;
                if !pending.roles.is_empty() {
                    merge_table(&self.dir.join("roles.json"), to_values(&pending.roles), &[])
                        .await?;
                }
                // The fallback bucket must not shadow ids that now have
                // member data, including ids persisted by earlier flushes.
                let superseded: Vec<String> = members.keys().cloned().collect();
                merge_table(
                    &self.dir.join("users.json"),
                    to_values(&pending.users),
                    &superseded,
                )
                .await?;
            }
        }

        tracing::debug!(
            users = pending.users.len(),
            members = pending.members.len(),
            roles = pending.roles.len(),
            "flushed reference entities"
        );
        Ok(())
    }
}

fn to_values<T: Serialize>(entries: &HashMap<Snowflake, T>) -> BTreeMap<String, serde_json::Value> {
    entries
        .iter()
        .filter_map(|(id, record)| {
            serde_json::to_value(record)
                .ok()
                .map(|value| (id.to_string(), value))
        })
        .collect()
}

/// Load-overlay-write one table file under its global lock.
///
/// Returns the merged table so callers can act on the full keyset.
async fn merge_table(
    path: &Path,
    updates: BTreeMap<String, serde_json::Value>,
    remove: &[String],
) -> Result<BTreeMap<String, serde_json::Value>> {
    let lock = table_lock(path).await;
    let _guard = lock.lock().await;

    let mut table = load_table(path).await;
    for (key, value) in updates {
        table.insert(key, value);
    }
    for key in remove {
        table.remove(key);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(&table)?;
    let staging = path.with_extension("json.part");
    fs::write(&staging, &bytes).await?;
    fs::rename(&staging, path).await?;

    Ok(table)
}

/// Read an existing table, treating a missing or unreadable file as empty.
/// Corruption trades historical merge completeness for availability.
async fn load_table(path: &Path) -> BTreeMap<String, serde_json::Value> {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "existing reference table is corrupt, starting over"
                );
                BTreeMap::new()
            }
        },
        Err(_) => BTreeMap::new(),
    }
}

/// One write lock per table file across the whole process, so concurrent
/// exports into a shared output directory cannot interleave partial writes.
async fn table_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .await;
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: u64) -> User {
        User {
            id: Snowflake::new(id),
            is_bot: false,
            discriminator: None,
            name: format!("user{id}"),
            display_name: format!("User {id}"),
            avatar_url: Some(format!("https://cdn.example.com/avatars/{id}/a.png")),
        }
    }

    fn member(id: u64, roles: &[u64]) -> Member {
        Member {
            user: user(id),
            nick: None,
            avatar_url: None,
            role_ids: roles.iter().copied().map(Snowflake::new).collect(),
        }
    }

    fn role(id: u64, position: i64, color: Option<u32>) -> Role {
        Role {
            id: Snowflake::new(id),
            name: format!("role{id}"),
            position,
            color,
        }
    }

    async fn read_table(path: &Path) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_slice(&fs::read(path).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn dm_session_writes_a_single_user_entry() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReferenceWriter::new(dir.path().to_path_buf(), ReferenceMode::DirectMessages);

        writer.track(&user(100), None, &[]).await;
        writer.flush().await.unwrap();

        let table = read_table(&dir.path().join("users.json")).await;
        assert_eq!(table.len(), 1);
        let entry = &table["100"];
        assert_eq!(entry["id"], "100");
        assert_eq!(entry["name"], "user100");
        assert_eq!(entry["displayName"], "User 100");
        assert_eq!(entry["isBot"], false);
        assert!(entry["avatarUrl"].as_str().unwrap().contains("100"));
        // Guild tables are never written for direct messages
        assert!(!dir.path().join("members.json").exists());
        assert!(!dir.path().join("roles.json").exists());
    }

    #[tokio::test]
    async fn guild_session_files_members_with_roles_and_no_fallback_entry() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReferenceWriter::new(dir.path().to_path_buf(), ReferenceMode::Guild);

        let m = member(200, &[10, 20]);
        let roles = [role(10, 1, Some(0xff0000)), role(20, 2, None)];
        writer.track(&user(200), Some(&m), &roles).await;
        writer.flush().await.unwrap();

        let members = read_table(&dir.path().join("members.json")).await;
        let entry = &members["200"];
        assert_eq!(
            entry["roleIds"],
            serde_json::json!(["10", "20"]),
        );

        let users = read_table(&dir.path().join("users.json")).await;
        assert!(
            !users.contains_key("200"),
            "member data must supersede the fallback user bucket"
        );

        let roles_table = read_table(&dir.path().join("roles.json")).await;
        assert_eq!(roles_table["10"]["color"], "#ff0000");
        assert_eq!(roles_table["10"]["position"], 1);
        assert!(roles_table["20"].get("color").is_none());
    }

    #[tokio::test]
    async fn merges_are_monotonic_across_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReferenceWriter::new(dir.path().to_path_buf(), ReferenceMode::DirectMessages);

        writer.track(&user(1), None, &[]).await;
        writer.flush().await.unwrap();
        writer.track(&user(2), None, &[]).await;
        writer.flush().await.unwrap();

        let table = read_table(&dir.path().join("users.json")).await;
        assert_eq!(table.len(), 2, "earlier entities survive later flushes");
    }

    #[tokio::test]
    async fn newer_data_wins_for_the_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReferenceWriter::new(dir.path().to_path_buf(), ReferenceMode::DirectMessages);

        writer.track(&user(7), None, &[]).await;
        writer.flush().await.unwrap();

        let mut renamed = user(7);
        renamed.name = "renamed".to_string();
        writer.track(&renamed, None, &[]).await;
        writer.flush().await.unwrap();

        let table = read_table(&dir.path().join("users.json")).await;
        assert_eq!(table.len(), 1);
        assert_eq!(table["7"]["name"], "renamed");
    }

    #[tokio::test]
    async fn member_data_evicts_previously_persisted_fallback_user() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReferenceWriter::new(dir.path().to_path_buf(), ReferenceMode::Guild);

        // First flush only knows the bare user
        writer.track(&user(300), None, &[]).await;
        writer.flush().await.unwrap();
        assert!(
            read_table(&dir.path().join("users.json")).await.contains_key("300")
        );

        // A later partition resolves full member data for the same id
        let m = member(300, &[10]);
        writer.track(&user(300), Some(&m), &[role(10, 1, None)]).await;
        writer.flush().await.unwrap();

        let users = read_table(&dir.path().join("users.json")).await;
        assert!(!users.contains_key("300"));
        let members = read_table(&dir.path().join("members.json")).await;
        assert!(members.contains_key("300"));
    }

    #[tokio::test]
    async fn flush_with_nothing_tracked_leaves_tables_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReferenceWriter::new(dir.path().to_path_buf(), ReferenceMode::DirectMessages);

        writer.track(&user(42), None, &[]).await;
        writer.flush().await.unwrap();
        let path = dir.path().join("users.json");
        let before = fs::read(&path).await.unwrap();

        writer.flush().await.unwrap();
        let after = fs::read(&path).await.unwrap();
        assert_eq!(before, after, "idempotent flush must not rewrite tables");
    }

    #[tokio::test]
    async fn corrupt_existing_table_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(&path, b"{ not json").await.unwrap();

        let writer = ReferenceWriter::new(dir.path().to_path_buf(), ReferenceMode::DirectMessages);
        writer.track(&user(5), None, &[]).await;
        writer.flush().await.unwrap();

        let table = read_table(&path).await;
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("5"));
    }

    #[tokio::test]
    async fn concurrent_writers_sharing_a_directory_do_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();

        let tasks: Vec<_> = (0..8u64)
            .map(|i| {
                let dir_path = dir_path.clone();
                tokio::spawn(async move {
                    let writer =
                        ReferenceWriter::new(dir_path, ReferenceMode::DirectMessages);
                    writer.track(&user(1000 + i), None, &[]).await;
                    writer.flush().await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let table = read_table(&dir.path().join("users.json")).await;
        assert_eq!(table.len(), 8, "every concurrent flush must be merged");
    }
}
