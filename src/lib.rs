mod client;
mod config;
mod error;
mod listing;
mod navigator;
mod pool;
mod transfer;
mod tree;
mod utils;

pub mod session;

// Re-export commonly used types
pub use client::{Client, ClientOptions, FailurePolicy};
pub use config::{Config, ConfigManager, DEFAULT_FTP_PORT, ServerProfile, Settings};
pub use error::{Error, Result};
pub use listing::{
    DirectoryEntry, EntryKind, ListingFormat, is_relative_name, parse_line, parse_listing,
    parse_listing_at,
};
pub use navigator::Navigator;
pub use pool::{Lease, PoolSettings, SessionPool};
pub use session::{DirectoryOps, FtpSession, MemorySession, Session};
pub use transfer::{
    ChannelProgress, DEFAULT_BLOCK_SIZE, LogProgress, NoProgress, ProgressSink, ProgressUpdate,
    TransferProgress,
};
pub use tree::{IgnoreFn, TransferError, TreeOutcome, download_tree, ignore_patterns, upload_tree};
pub use utils::init_tracing;
