//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use chat_recall::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Ask { message, json, .. } => println!("{message} (json: {json})"),
//!     _ => {}
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Read the configuration from this file instead of the default location.
    #[arg(long, global = true, env = "RECALL_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Ask one question, answered with any relevant memories as context.
    #[clap(name = "ask", alias = "a")]
    Ask {
        message: String,

        /// Print `{response, debug}` as JSON instead of the bare answer.
        #[arg(long)]
        json: bool,

        /// Send this image file along with the question (generate backend only).
        #[arg(long)]
        image: Option<PathBuf>,
    },

    /// Ask questions line by line from stdin until `exit`.
    ///
    /// This subcommand can be invoked with either 'i' or 'interactive'.
    #[clap(name = "interactive", alias = "i")]
    Interactive,

    /// Show the memories closest to a query without asking the model.
    #[clap(name = "search", alias = "s")]
    Search {
        query: String,

        /// Number of neighbours to show (defaults to `top_k` from the config).
        #[arg(short = 'k')]
        k: Option<usize>,
    },

    /// Print the number of memories, their dimension and the artifact path.
    Stats,

    /// Write a default `config.yaml` and create the data directory.
    Init,
}
