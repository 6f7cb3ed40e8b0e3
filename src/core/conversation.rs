//! Conversation, folder, and prompt state for the chat loop.
//!
//! All mutation goes through [`HomeState::apply`], so a caller can persist
//! the state after every transition without tracking which part changed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::completion::CompletionRequest;
use crate::core::constants::{DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE};
use crate::core::message::Message;
use crate::core::models::ModelDescriptor;

pub const NEW_CONVERSATION_NAME: &str = "New Conversation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub messages: Vec<Message>,
    pub model_id: String,
    pub prompt: String,
    pub temperature: f32,
    pub folder_id: Option<String>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: NEW_CONVERSATION_NAME.to_string(),
            messages: Vec::new(),
            model_id: model_id.into(),
            prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            folder_id: None,
        }
    }

    /// Build the request for the next assistant turn.
    pub fn completion_request(&self, model: ModelDescriptor) -> CompletionRequest {
        CompletionRequest::new(model, self.messages.clone())
            .with_system_prompt(self.prompt.clone())
            .with_temperature(Some(self.temperature))
    }

    /// Name the conversation after its first user message, as long as it
    /// still carries the placeholder name.
    pub fn derived_name(&self) -> Option<String> {
        if self.name != NEW_CONVERSATION_NAME {
            return None;
        }
        let first = self.messages.iter().find(|m| m.is_user())?;
        let name: String = first.content.trim().chars().take(30).collect();
        (!name.is_empty()).then_some(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderKind {
    Chat,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FolderKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
    pub model_id: String,
    #[serde(default)]
    pub folder_id: Option<String>,
}

/// A single field edit on a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationField {
    Name(String),
    Messages(Vec<Message>),
    ModelId(String),
    Prompt(String),
    Temperature(f32),
    FolderId(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    SelectConversation(String),
    /// Appends `conversation`; its model and temperature are replaced by the
    /// last conversation's when one exists.
    NewConversation(Conversation),
    CreateFolder(Folder),
    DeleteFolder(String),
    RenameFolder { id: String, name: String },
    UpdateConversation { id: String, field: ConversationField },
    DeleteConversation(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HomeState {
    pub conversations: Vec<Conversation>,
    pub folders: Vec<Folder>,
    pub prompts: Vec<Prompt>,
    pub selected_conversation: Option<Conversation>,
}

impl HomeState {
    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected_conversation.as_ref().map(|c| c.id.as_str())
    }

    /// Start a fresh conversation and return its id.
    pub fn new_conversation(&mut self, default_model_id: &str) -> String {
        let conversation = Conversation::new(Uuid::new_v4().to_string(), default_model_id);
        let id = conversation.id.clone();
        self.apply(Transition::NewConversation(conversation));
        id
    }

    /// Create a folder and return its id.
    pub fn create_folder(&mut self, name: impl Into<String>, kind: FolderKind) -> String {
        let folder = Folder {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
        };
        let id = folder.id.clone();
        self.apply(Transition::CreateFolder(folder));
        id
    }

    /// The snapshot that results from `transition`; `self` is left as is.
    pub fn reduce(&self, transition: Transition) -> HomeState {
        let mut next = self.clone();
        next.apply(transition);
        next
    }

    /// Apply `transition` in place. Returns `false` when it referred to an id
    /// that does not exist and the state was left untouched.
    pub fn apply(&mut self, transition: Transition) -> bool {
        match transition {
            Transition::SelectConversation(id) => match self.conversation(&id) {
                Some(conversation) => {
                    self.selected_conversation = Some(conversation.clone());
                    true
                }
                None => false,
            },
            Transition::NewConversation(mut conversation) => {
                if let Some(last) = self.conversations.last() {
                    conversation.model_id = last.model_id.clone();
                    conversation.temperature = last.temperature;
                }
                self.selected_conversation = Some(conversation.clone());
                self.conversations.push(conversation);
                true
            }
            Transition::CreateFolder(folder) => {
                self.folders.push(folder);
                true
            }
            Transition::DeleteFolder(id) => {
                let before = self.folders.len();
                self.folders.retain(|f| f.id != id);
                if self.folders.len() == before {
                    return false;
                }
                let detached = Some(id);
                for conversation in &mut self.conversations {
                    if conversation.folder_id == detached {
                        conversation.folder_id = None;
                    }
                }
                for prompt in &mut self.prompts {
                    if prompt.folder_id == detached {
                        prompt.folder_id = None;
                    }
                }
                if let Some(selected) = &mut self.selected_conversation {
                    if selected.folder_id == detached {
                        selected.folder_id = None;
                    }
                }
                true
            }
            Transition::RenameFolder { id, name } => {
                match self.folders.iter_mut().find(|f| f.id == id) {
                    Some(folder) => {
                        folder.name = name;
                        true
                    }
                    None => false,
                }
            }
            Transition::UpdateConversation { id, field } => {
                let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) else {
                    return false;
                };
                match field {
                    ConversationField::Name(name) => conversation.name = name,
                    ConversationField::Messages(messages) => conversation.messages = messages,
                    ConversationField::ModelId(model_id) => conversation.model_id = model_id,
                    ConversationField::Prompt(prompt) => conversation.prompt = prompt,
                    ConversationField::Temperature(t) => conversation.temperature = t,
                    ConversationField::FolderId(folder_id) => conversation.folder_id = folder_id,
                }
                self.selected_conversation = Some(conversation.clone());
                true
            }
            Transition::DeleteConversation(id) => {
                let before = self.conversations.len();
                self.conversations.retain(|c| c.id != id);
                if self.conversations.len() == before {
                    return false;
                }
                if self.selected_id() == Some(id.as_str()) {
                    self.selected_conversation = self.conversations.last().cloned();
                }
                true
            }
        }
    }
}
