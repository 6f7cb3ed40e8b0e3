//! Persistence for [`HomeState`].
//!
//! State is kept as JSON documents in a string key/value store. Loading is
//! forgiving: records written by older versions, or damaged by hand edits,
//! are repaired where possible and dropped otherwise.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::config::data::path_display;
use crate::core::constants::{DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE};
use crate::core::conversation::{Conversation, Folder, HomeState, Prompt, NEW_CONVERSATION_NAME};
use crate::core::message::Message;

pub const CONVERSATIONS_KEY: &str = "conversationHistory";
pub const FOLDERS_KEY: &str = "folders";
pub const PROMPTS_KEY: &str = "prompts";
pub const SELECTED_CONVERSATION_KEY: &str = "selectedConversation";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("Failed to access {}: {source}", path_display(.path))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encode {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },

    #[error("Failed to determine data directory")]
    NoDataDir,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_location() -> Result<Self, StorageError> {
        let proj_dirs =
            ProjectDirs::from("org", "chatpipe", "chatpipe").ok_or(StorageError::NoDataDir)?;
        Ok(Self::new(proj_dirs.data_dir().join("state")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let io_err = |source: std::io::Error| StorageError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut temp_file = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        temp_file.write_all(value.as_bytes()).map_err(io_err)?;
        temp_file.as_file_mut().sync_all().map_err(io_err)?;
        temp_file.persist(&path).map_err(|err| io_err(err.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

/// Conversation record as it may appear on disk. Older records carried the
/// whole model object instead of its id.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredConversation {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    model: Option<StoredModel>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    folder_id: Option<String>,
}

#[derive(Deserialize)]
struct StoredModel {
    id: String,
}

impl StoredConversation {
    fn clean(self, default_model_id: &str) -> Conversation {
        let model_id = self
            .model_id
            .or(self.model.map(|m| m.id))
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| default_model_id.to_string());
        Conversation {
            id: self.id,
            name: self
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| NEW_CONVERSATION_NAME.to_string()),
            messages: self.messages,
            model_id,
            prompt: self
                .prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            folder_id: self.folder_id,
        }
    }
}

/// Loads and saves [`HomeState`] through a [`KeyValueStore`].
pub struct StateStore<S> {
    store: S,
}

impl<S: KeyValueStore> StateStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Read everything back. Absent keys and records that no longer decode are
    /// logged and skipped; a store that cannot be read at all is an error, so
    /// callers never mistake it for empty state and save over it.
    pub fn load(&self, default_model_id: &str) -> Result<HomeState, StorageError> {
        let conversations: Vec<Conversation> = self
            .load_records::<StoredConversation>(CONVERSATIONS_KEY)?
            .into_iter()
            .map(|record| record.clean(default_model_id))
            .collect();
        let folders = self.load_records::<Folder>(FOLDERS_KEY)?;
        let prompts = self.load_records::<Prompt>(PROMPTS_KEY)?;

        let stored_selection = self
            .read_value(SELECTED_CONVERSATION_KEY)?
            .and_then(|value| match serde_json::from_value::<StoredConversation>(value) {
                Ok(record) => Some(record.clean(default_model_id)),
                Err(err) => {
                    warn!(error = %err, "Dropping unreadable selected conversation");
                    None
                }
            });

        // The list is saved after every transition, so prefer its copy.
        let selected_conversation = match stored_selection {
            Some(selected) => conversations
                .iter()
                .find(|c| c.id == selected.id)
                .cloned()
                .or(Some(selected)),
            None => conversations.last().cloned(),
        };

        debug!(
            conversations = conversations.len(),
            folders = folders.len(),
            prompts = prompts.len(),
            "Loaded conversation state"
        );

        Ok(HomeState {
            conversations,
            folders,
            prompts,
            selected_conversation,
        })
    }

    pub fn save(&self, state: &HomeState) -> Result<(), StorageError> {
        self.write_json(CONVERSATIONS_KEY, &state.conversations)?;
        self.write_json(FOLDERS_KEY, &state.folders)?;
        self.write_json(PROMPTS_KEY, &state.prompts)?;
        match &state.selected_conversation {
            Some(selected) => self.write_json(SELECTED_CONVERSATION_KEY, selected),
            None => self.store.remove(SELECTED_CONVERSATION_KEY),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.store.set(key, &json)
    }

    fn read_value(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(key, error = %err, "Stored state is not valid JSON; ignoring it");
                Ok(None)
            }
        }
    }

    fn load_records<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StorageError> {
        let Some(value) = self.read_value(key)? else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            warn!(key, "Stored state is not a list; ignoring it");
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value(item) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(key, index, error = %err, "Dropping unreadable record");
                    None
                }
            })
            .collect())
    }
}
