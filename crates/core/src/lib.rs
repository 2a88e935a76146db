//! Core of the Mari language-learning assistant: the conversation store, the
//! one-shot lesson calls and the live spoken session bridge. Platform audio
//! and the live wire protocol live in their own crates and plug in through
//! the traits in `live` and `gateway`.

pub mod audio;
pub mod gateway;
pub mod lesson;
pub mod live;
pub mod llm_client;
pub mod models;
pub mod prompts;
pub mod store;
