pub mod budget;
pub mod chat_stream;
pub mod completion;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod error;
pub mod message;
pub mod models;
pub mod providers;
pub mod storage;
pub mod tokenizer;
