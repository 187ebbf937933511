//! Engine implementations for toolchat.
//!
//! All engines implement `toolchat_core::Engine` and are created through a
//! `toolchat_core::EngineLoader`.

pub mod openai_compat;
pub mod scripted;

pub use openai_compat::{OpenAiCompatEngine, OpenAiCompatLoader};
pub use scripted::{Script, ScriptedEngine, ScriptedLoader, BOUNDARY_PLACEHOLDER};
