use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chatkeep")]
#[command(author, version, about = "Inspect and edit stored chat conversations", long_about = None)]
pub struct Cli {
    /// Settings file (default: config/$CONFIG_ENV, then APP__* environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Append a turn to a conversation, creating it if needed
    Append {
        conversation: String,

        /// user, assistant or system
        role: String,

        text: String,

        /// Session for new conversations (default: "global")
        #[arg(short, long)]
        session: Option<String>,

        /// Structured components as a JSON document, stored verbatim
        #[arg(long)]
        components: Option<String>,
    },

    /// Print the turns of a conversation
    History {
        conversation: String,

        /// Only the most recent N turns
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Delete a conversation from memory and storage
    Delete { conversation: String },

    /// List conversations created under a session
    List {
        #[arg(short, long, default_value = "global")]
        session: String,
    },

    /// Show cache statistics
    Stats,
}
