use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::faces::store::ContentId;

const MAX_USER_ID_LEN: usize = 128;

pub type UserData = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(rename = "cid")]
    pub current_cid: ContentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_cid: Option<ContentId>,
    pub registered_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub user_data: UserData,
}

impl UserRecord {
    pub fn new(cid: ContentId, user_data: UserData) -> Self {
        Self {
            current_cid: cid,
            previous_cid: None,
            registered_at: timestamp_now(),
            updated_at: None,
            user_data,
        }
    }

    /// Makes `cid` current and keeps the replaced one as the single
    /// history entry.
    pub fn rotate(&mut self, cid: ContentId) {
        let previous = std::mem::replace(&mut self.current_cid, cid);
        self.previous_cid = Some(previous);
        self.updated_at = Some(timestamp_now());
    }
}

/// On-disk shape of the registry: `{ "users": { "<id>": { ... } } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
}

impl RegistryDocument {
    fn insert(&mut self, user_id: &str, record: UserRecord) -> AppResult<()> {
        if self.users.contains_key(user_id) {
            return Err(AppError::UserAlreadyExists {
                user: user_id.to_string(),
            });
        }
        self.users.insert(user_id.to_string(), record);
        Ok(())
    }

    fn get(&self, user_id: &str) -> AppResult<UserRecord> {
        self.users
            .get(user_id)
            .cloned()
            .ok_or_else(|| AppError::UserNotFound {
                user: user_id.to_string(),
            })
    }

    fn apply(
        &mut self,
        user_id: &str,
        mutation: &mut dyn FnMut(&mut UserRecord),
    ) -> AppResult<UserRecord> {
        let record = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::UserNotFound {
                user: user_id.to_string(),
            })?;
        mutation(record);
        Ok(record.clone())
    }

    fn entries(&self) -> Vec<(String, UserRecord)> {
        self.users
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }
}

/// Persistent map from user id to [`UserRecord`].
///
/// `register` and `update` are atomic with respect to each other: the
/// existence check and the write happen under one lock, and a failed write
/// leaves the previous state visible.
pub trait UserRegistry: Send + Sync {
    fn register(&self, user_id: &str, record: UserRecord) -> AppResult<()>;

    fn get(&self, user_id: &str) -> AppResult<UserRecord>;

    fn update(
        &self,
        user_id: &str,
        mutation: &mut dyn FnMut(&mut UserRecord),
    ) -> AppResult<UserRecord>;

    fn list(&self) -> AppResult<Vec<(String, UserRecord)>>;

    fn contains(&self, user_id: &str) -> AppResult<bool> {
        match self.get(user_id) {
            Ok(_) => Ok(true),
            Err(AppError::UserNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserRegistry {
    document: Mutex<RegistryDocument>,
}

impl MemoryUserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryDocument> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UserRegistry for MemoryUserRegistry {
    fn register(&self, user_id: &str, record: UserRecord) -> AppResult<()> {
        self.lock().insert(user_id, record)
    }

    fn get(&self, user_id: &str) -> AppResult<UserRecord> {
        self.lock().get(user_id)
    }

    fn update(
        &self,
        user_id: &str,
        mutation: &mut dyn FnMut(&mut UserRecord),
    ) -> AppResult<UserRecord> {
        self.lock().apply(user_id, mutation)
    }

    fn list(&self) -> AppResult<Vec<(String, UserRecord)>> {
        Ok(self.lock().entries())
    }
}

/// JSON-file registry. Every mutation is staged on a copy, written to a
/// temp file next to the target, synced, then renamed over it; the
/// in-memory copy is swapped only after the rename succeeds.
#[derive(Debug)]
pub struct FileUserRegistry {
    path: PathBuf,
    document: Mutex<RegistryDocument>,
}

impl FileUserRegistry {
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let document = read_registry_document(&path)?;
        debug!(
            path = %path.display(),
            users = document.users.len(),
            "opened user registry"
        );
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, RegistryDocument> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn commit(
        &self,
        guard: &mut MutexGuard<'_, RegistryDocument>,
        staged: RegistryDocument,
    ) -> AppResult<()> {
        write_registry_document(&self.path, &staged)?;
        **guard = staged;
        Ok(())
    }
}

impl UserRegistry for FileUserRegistry {
    fn register(&self, user_id: &str, record: UserRecord) -> AppResult<()> {
        let mut guard = self.lock();
        let mut staged = guard.clone();
        staged.insert(user_id, record)?;
        self.commit(&mut guard, staged)
    }

    fn get(&self, user_id: &str) -> AppResult<UserRecord> {
        self.lock().get(user_id)
    }

    fn update(
        &self,
        user_id: &str,
        mutation: &mut dyn FnMut(&mut UserRecord),
    ) -> AppResult<UserRecord> {
        let mut guard = self.lock();
        let mut staged = guard.clone();
        let updated = staged.apply(user_id, mutation)?;
        self.commit(&mut guard, staged)?;
        Ok(updated)
    }

    fn list(&self) -> AppResult<Vec<(String, UserRecord)>> {
        Ok(self.lock().entries())
    }
}

pub fn read_registry_document(path: &Path) -> AppResult<RegistryDocument> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(RegistryDocument::default())
        }
        Err(source) => {
            return Err(AppError::RegistryRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&data).map_err(|err| AppError::InvalidRegistry {
        path: path.to_path_buf(),
        message: format!("invalid registry contents: {err}"),
    })
}

pub fn write_registry_document(path: &Path, document: &RegistryDocument) -> AppResult<()> {
    let write_err = |source: io::Error| AppError::RegistryWrite {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|source| AppError::RegistryWrite {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            let serialized = serde_json::to_vec_pretty(document)?;
            writer.write_all(&serialized).map_err(write_err)?;
            writer.write_all(b"\n").map_err(write_err)?;
            writer.flush().map_err(write_err)?;
        }
        file.sync_all().map_err(write_err)?;
    }

    let file = tmp.persist(path).map_err(|err| write_err(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(write_err)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(write_err)?;
    }
    #[cfg(not(unix))]
    drop(file);

    Ok(())
}

pub fn validate_user_id(user: &str) -> AppResult<()> {
    if user.is_empty() {
        return Err(AppError::InvalidUser {
            user: user.to_string(),
            message: "user id cannot be empty".into(),
        });
    }

    if user.len() > MAX_USER_ID_LEN {
        return Err(AppError::InvalidUser {
            user: user.to_string(),
            message: format!("user id longer than {MAX_USER_ID_LEN} characters"),
        });
    }

    if !user
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@'))
    {
        return Err(AppError::InvalidUser {
            user: user.to_string(),
            message: "use ASCII letters, numbers, '-', '_', '.' or '@' only".into(),
        });
    }

    Ok(())
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
