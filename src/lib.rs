//! chatpipe sends chat conversations to OpenAI-compatible completion APIs.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the model registry, tokenizers, the context budgeter that
//!   trims history to fit a model's window, the streaming completion client,
//!   conversation state, and its persistence.
//! - [`api`] defines the chat completion payloads exchanged with the API.
//! - [`utils`] holds URL, auth header, and logging helpers.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`], which dispatches to the `say`, `chat`,
//! `models`, and `set`/`unset` commands.

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
