//! Line-based chat over saved conversations
//!
//! Every line is either a message for the selected conversation or a slash
//! command that manages conversations and folders. State is saved after each
//! change so an interrupted session loses at most the reply in flight.

use std::error::Error;
use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::cli::say::{stream_reply, ReplyOutcome};
use crate::cli::{resolve_model, session_or_exit};
use crate::core::completion::ChatClient;
use crate::core::config::Config;
use crate::core::conversation::{
    Conversation, ConversationField, FolderKind, HomeState, Transition,
};
use crate::core::message::Message;
use crate::core::models::{ModelDescriptor, ModelRegistry};
use crate::core::storage::{FileStore, KeyValueStore, StateStore, StorageError};

const HELP: &str = "Commands:
  /new               Start a new conversation
  /list              List conversations
  /switch <n>        Select conversation number n
  /rename <name>     Rename the current conversation
  /model <id>        Change the current conversation's model
  /temperature <t>   Change the sampling temperature (0-2)
  /prompt <text>     Change the system prompt
  /delete            Delete the current conversation
  /folders           List folders
  /mkdir <name>      Create a folder
  /rmdir <name>      Delete a folder (its conversations are kept)
  /move [folder]     Move the current conversation into a folder, or out of one
  /help              Show this help
  /quit              Exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    New,
    List,
    Switch(usize),
    Rename(String),
    Model(String),
    Temperature(f32),
    Prompt(String),
    Delete,
    Folders,
    Mkdir(String),
    Rmdir(String),
    Move(Option<String>),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatInput {
    Empty,
    Message(String),
    Command(ChatCommand),
}

fn required(arg: &str, usage: &str) -> Result<String, String> {
    if arg.is_empty() {
        Err(format!("Usage: {usage}"))
    } else {
        Ok(arg.to_string())
    }
}

pub fn parse_input(line: &str) -> Result<ChatInput, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ChatInput::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(ChatInput::Message(line.to_string()));
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };

    let command = match name {
        "new" => ChatCommand::New,
        "list" | "ls" => ChatCommand::List,
        "switch" => {
            let index = arg
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| "Usage: /switch <n>".to_string())?;
            ChatCommand::Switch(index)
        }
        "rename" => ChatCommand::Rename(required(arg, "/rename <name>")?),
        "model" => ChatCommand::Model(required(arg, "/model <id>")?),
        "temperature" | "temp" => {
            let value: f32 = arg
                .parse()
                .map_err(|_| "Usage: /temperature <0-2>".to_string())?;
            if !(0.0..=2.0).contains(&value) {
                return Err("Temperature must be between 0 and 2".to_string());
            }
            ChatCommand::Temperature(value)
        }
        "prompt" => ChatCommand::Prompt(required(arg, "/prompt <text>")?),
        "delete" => ChatCommand::Delete,
        "folders" => ChatCommand::Folders,
        "mkdir" => ChatCommand::Mkdir(required(arg, "/mkdir <name>")?),
        "rmdir" => ChatCommand::Rmdir(required(arg, "/rmdir <name>")?),
        "move" => ChatCommand::Move((!arg.is_empty()).then(|| arg.to_string())),
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" => ChatCommand::Quit,
        other => return Err(format!("Unknown command /{other}. Type /help for a list.")),
    };
    Ok(ChatInput::Command(command))
}

/// Conversation state plus where it is saved.
pub struct ChatSession<S> {
    pub state: HomeState,
    store: StateStore<S>,
    registry: ModelRegistry,
    default_model_id: String,
}

impl<S: KeyValueStore> ChatSession<S> {
    pub fn open(
        store: StateStore<S>,
        registry: ModelRegistry,
        default_model_id: String,
    ) -> Result<Self, StorageError> {
        let state = store.load(&default_model_id)?;
        Ok(Self {
            state,
            store,
            registry,
            default_model_id,
        })
    }

    fn save(&self) {
        if let Err(err) = self.store.save(&self.state) {
            warn!(error = %err, "failed to save conversations");
            eprintln!("⚠️  Could not save conversations: {err}");
        }
    }

    fn apply(&mut self, transition: Transition) -> bool {
        let changed = self.state.apply(transition);
        if changed {
            self.save();
        }
        changed
    }

    /// The selected conversation, creating one when there is none.
    pub fn current(&mut self) -> &Conversation {
        if self.state.selected_conversation.is_none() {
            self.state.new_conversation(&self.default_model_id);
            self.save();
        }
        self.state
            .selected_conversation
            .get_or_insert_with(|| Conversation::new("", ""))
    }

    fn current_id(&mut self) -> String {
        self.current().id.clone()
    }

    fn update_current(&mut self, field: ConversationField) -> bool {
        let id = self.current_id();
        self.apply(Transition::UpdateConversation { id, field })
    }

    pub fn model_for(&self, conversation: &Conversation) -> ModelDescriptor {
        match self.registry.get(&conversation.model_id) {
            Ok(model) => model.clone(),
            Err(_) => {
                warn!(model = %conversation.model_id, "conversation model is unknown");
                self.registry
                    .default_model(Some(&self.default_model_id))
                    .map(ModelDescriptor::clone)
                    .unwrap_or_else(|_| ModelDescriptor::new(&self.default_model_id, &self.default_model_id, 4096))
            }
        }
    }

    /// Append a user message; returns the conversation to send.
    pub fn push_user_message(&mut self, text: String) -> Conversation {
        let mut messages = self.current().messages.clone();
        messages.push(Message::user(text));
        self.update_current(ConversationField::Messages(messages));
        self.current().clone()
    }

    pub fn push_assistant_message(&mut self, text: String) {
        let mut messages = self.current().messages.clone();
        messages.push(Message::assistant(text));
        self.update_current(ConversationField::Messages(messages));
        if let Some(name) = self.current().derived_name() {
            self.update_current(ConversationField::Name(name));
        }
    }

    /// Run a command and return what to show the user.
    pub fn handle_command(&mut self, command: ChatCommand) -> Result<String, String> {
        match command {
            ChatCommand::New => {
                self.state.new_conversation(&self.default_model_id);
                self.save();
                let current = self.current();
                Ok(format!("Started a new conversation ({})", current.model_id))
            }
            ChatCommand::List => {
                if self.state.conversations.is_empty() {
                    return Ok("No conversations yet.".to_string());
                }
                let selected = self.state.selected_id().map(str::to_string);
                let lines: Vec<String> = self
                    .state
                    .conversations
                    .iter()
                    .enumerate()
                    .map(|(index, c)| {
                        let marker = if selected.as_deref() == Some(c.id.as_str()) { '*' } else { ' ' };
                        let folder = c
                            .folder_id
                            .as_ref()
                            .and_then(|id| self.state.folders.iter().find(|f| &f.id == id))
                            .map(|f| format!(" [{}]", f.name))
                            .unwrap_or_default();
                        format!(
                            "{marker} {}. {}{folder} ({}, {} messages)",
                            index + 1,
                            c.name,
                            c.model_id,
                            c.messages.len()
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            ChatCommand::Switch(index) => {
                let id = self
                    .state
                    .conversations
                    .get(index - 1)
                    .map(|c| c.id.clone())
                    .ok_or_else(|| format!("No conversation number {index}"))?;
                self.apply(Transition::SelectConversation(id));
                Ok(format!("Switched to: {}", self.current().name))
            }
            ChatCommand::Rename(name) => {
                self.update_current(ConversationField::Name(name.clone()));
                Ok(format!("Renamed to: {name}"))
            }
            ChatCommand::Model(id) => {
                if !self.registry.contains(&id) {
                    return Err(format!("Unknown model '{id}'"));
                }
                self.update_current(ConversationField::ModelId(id.clone()));
                Ok(format!("Model set to: {id}"))
            }
            ChatCommand::Temperature(value) => {
                self.update_current(ConversationField::Temperature(value));
                Ok(format!("Temperature set to: {value}"))
            }
            ChatCommand::Prompt(prompt) => {
                self.update_current(ConversationField::Prompt(prompt));
                Ok("System prompt updated".to_string())
            }
            ChatCommand::Delete => {
                let id = self.current_id();
                self.apply(Transition::DeleteConversation(id));
                let current = self.current();
                Ok(format!("Deleted. Now on: {}", current.name))
            }
            ChatCommand::Folders => {
                let names: Vec<&str> = self
                    .state
                    .folders
                    .iter()
                    .filter(|f| f.kind == FolderKind::Chat)
                    .map(|f| f.name.as_str())
                    .collect();
                if names.is_empty() {
                    Ok("No folders yet.".to_string())
                } else {
                    Ok(names.join("\n"))
                }
            }
            ChatCommand::Mkdir(name) => {
                if self.find_folder(&name).is_some() {
                    return Err(format!("Folder '{name}' already exists"));
                }
                self.state.create_folder(name.clone(), FolderKind::Chat);
                self.save();
                Ok(format!("Created folder: {name}"))
            }
            ChatCommand::Rmdir(name) => {
                let id = self
                    .find_folder(&name)
                    .ok_or_else(|| format!("No folder named '{name}'"))?;
                self.apply(Transition::DeleteFolder(id));
                Ok(format!("Deleted folder: {name}"))
            }
            ChatCommand::Move(Some(name)) => {
                let id = self
                    .find_folder(&name)
                    .ok_or_else(|| format!("No folder named '{name}'"))?;
                self.update_current(ConversationField::FolderId(Some(id)));
                Ok(format!("Moved to: {name}"))
            }
            ChatCommand::Move(None) => {
                self.update_current(ConversationField::FolderId(None));
                Ok("Removed from folder".to_string())
            }
            ChatCommand::Help => Ok(HELP.to_string()),
            ChatCommand::Quit => Ok(String::new()),
        }
    }

    fn find_folder(&self, name: &str) -> Option<String> {
        self.state
            .folders
            .iter()
            .find(|f| f.kind == FolderKind::Chat && f.name == name)
            .map(|f| f.id.clone())
    }
}

pub async fn run_chat(model: Option<String>, new: bool) -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let session = session_or_exit(&config);
    let default_model = resolve_model(&config, model.as_deref())?;
    let client = ChatClient::new(session.base_url.clone());

    let file_store = FileStore::default_location()?;
    debug!(dir = %file_store.dir().display(), "opening conversation store");
    let mut chat = ChatSession::open(
        StateStore::new(file_store),
        config.model_registry(),
        default_model.id.clone(),
    )?;
    if new {
        chat.handle_command(ChatCommand::New)?;
    } else if model.is_some() {
        chat.handle_command(ChatCommand::Model(default_model.id.clone()))?;
    }

    {
        let current = chat.current();
        eprintln!("💬 {} ({}) via {}", current.name, current.model_id, session.display_name);
        eprintln!("Type a message, or /help for commands.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        io::stderr().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let text = match parse_input(&line) {
            Ok(ChatInput::Empty) => continue,
            Ok(ChatInput::Command(ChatCommand::Quit)) => break,
            Ok(ChatInput::Command(command)) => {
                match chat.handle_command(command) {
                    Ok(feedback) => println!("{feedback}"),
                    Err(err) => eprintln!("❌ {err}"),
                }
                continue;
            }
            Ok(ChatInput::Message(text)) => text,
            Err(err) => {
                eprintln!("❌ {err}");
                continue;
            }
        };

        let conversation = chat.push_user_message(text);
        let request = conversation.completion_request(chat.model_for(&conversation));
        let mut stdout = io::stdout();
        match stream_reply(&client, &session.api_key, request, &mut stdout).await? {
            ReplyOutcome::Complete(reply) => {
                println!();
                chat.push_assistant_message(reply);
            }
            ReplyOutcome::Failed { partial, error } => {
                if !partial.is_empty() {
                    println!();
                }
                eprintln!("❌ Error: {error}");
            }
        }
    }

    Ok(())
}
