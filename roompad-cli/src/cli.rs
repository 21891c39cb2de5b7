use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "roompad", version, about = "Shared text rooms over WebSocket")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the room server
    Serve {
        /// Address to listen on
        #[arg(long, env = "ROOMPAD_BIND", default_value = "127.0.0.1:9090")]
        bind: String,
        /// RocksDB directory; rooms live in memory only when omitted
        #[arg(long, env = "ROOMPAD_DATA")]
        data: Option<PathBuf>,
    },
    /// Create a room and print its code
    Create {
        #[arg(long, env = "ROOMPAD_URL", default_value = "ws://127.0.0.1:9090")]
        url: String,
    },
    /// Join a room; every stdin line replaces the room's content
    Join {
        /// Room code (case-insensitive)
        code: String,
        #[arg(long, env = "ROOMPAD_URL", default_value = "ws://127.0.0.1:9090")]
        url: String,
        /// Quiet period before an edit is written
        #[arg(long, default_value_t = 300)]
        debounce_ms: u64,
        /// Seconds to wait for a server response
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}
