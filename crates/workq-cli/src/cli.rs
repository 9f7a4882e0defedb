use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "workq",
    about = "Seed, inspect and maintain database-backed work-item queues",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enqueue a work item into the configured input queue.
    Seed {
        /// Inline JSON payload.
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// Read the JSON payload from a file.
        #[arg(long)]
        payload_file: Option<PathBuf>,

        /// Attach a file (repeatable).
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// Dedup key; a repeat seed with the same callid is skipped
        /// (document backend).
        #[arg(long)]
        callid: Option<String>,

        /// Parent work item id.
        #[arg(long)]
        parent: Option<String>,
    },

    /// Return stale RESERVED items to the queue.
    Recover {
        /// Orphan cutoff in minutes (default: configured timeout).
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print a work item's payload and files.
    Show {
        /// Work item id.
        id: String,
    },
}
