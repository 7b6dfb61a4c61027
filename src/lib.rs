//! # Chat Recall (library root)
//!
//! A small long-term memory for a chat assistant. Every answered question is
//! embedded and kept in a durable vector store; later questions that land close
//! to an earlier one are answered with that earlier exchange as context.
//!
//! Layers, bottom up:
//! - [`index`]: exact nearest-neighbour search over fixed-width vectors.
//! - [`records`]: the text and payload stored beside each vector.
//! - [`store`]: the two kept in lock-step, plus [`Store::open`](store::Store::open).
//! - [`persistence`]: single-file artifact with checksum and crash-safe replace.
//! - [`embedding`], [`generation`]: the ports to the sentence encoder and the LLM.
//! - [`policy`]: the retrieve → decide → generate → commit loop.
//! - [`config`], [`commands`]: YAML configuration and the `recall` CLI.
//!
//! The store's config and data live under the per-platform directory returned
//! by [`config_dir`]:
//!
//! - macOS: `~/Library/Application Support/com.chat-recall.recall`
//! - Linux (XDG): `~/.config/recall`
//! - Windows: `C:\Users\<you>\AppData\Roaming\chat-recall\recall\config`

use directories::ProjectDirs;
use std::{error::Error, path::PathBuf};

pub mod commands;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod persistence;
pub mod policy;
pub mod records;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{MemoryError, Result};

/// Return the per-platform configuration directory used by `recall`.
///
/// The directory is **not** created by this function; callers that need it should
/// create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be determined
/// (which is rare but possible in heavily sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = chat_recall::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> std::result::Result<PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "chat-recall", "recall")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
