//! wnscrape: keeps web novels in sync with their source sites using a declarative per-host
//! decode guide, and compiles them into EPUB volumes.

pub mod cli;
pub mod config;
pub mod decode;
pub mod epub;
pub mod fetch;
pub mod logging;
pub mod model;
pub mod store;
pub mod sync;

// Re-exports for CLI and consumers.
pub use decode::{DecodeError, DecodeGuide, Decoder, Field, ProcessorRegistry};
pub use epub::{write_epub, EpubError, EpubOptions, EpubVersion};
pub use fetch::{FetchError, Fetcher, RequestPolicy};
pub use model::{Chapter, Metadata, Work};
pub use store::{ContentStore, FileStore, MemoryStore, StoreError};
pub use sync::{
    ChapterRef, ContentFailurePolicy, NovelSync, SyncContext, SyncError, SyncOptions, TocSource,
};
