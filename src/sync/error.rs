//! Errors of the synchronization engine.

use crate::decode::DecodeError;
use crate::epub::EpubError;
use crate::fetch::FetchError;
use crate::model::WorkRecordError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] WorkRecordError),

    #[error(transparent)]
    Epub(#[from] EpubError),

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Work '{title}' already exists; pass --force to overwrite it.")]
    WorkExists { title: String },

    #[error("No work found in {location}. Create it first with create-novel.")]
    WorkNotFound { location: String },

    #[error("Work '{work}' has no TOC: set a TOC URL or add TOC HTML first.")]
    NoTocSource { work: String },

    #[error("No chapter links found in the TOC of '{work}' (host '{host}').")]
    NoChapterLinks { work: String, host: String },

    #[error("Chapter {reference} not found in '{work}'.")]
    ChapterNotFound { work: String, reference: String },

    #[error("No content found for chapter {url} of '{work}'.")]
    ContentExtraction { work: String, url: String },
}

impl SyncError {
    /// Whether a bulk run must stop on this error instead of recording it and moving on.
    ///
    /// Network exhaustion and extraction failures are per-chapter; configuration and
    /// persistence failures affect every chapter alike.
    pub fn is_fatal_to_batch(&self) -> bool {
        match self {
            SyncError::Fetch(e) => !matches!(e, FetchError::Exhausted { .. }),
            SyncError::ContentExtraction { .. } => false,
            SyncError::Decode(DecodeError::ParseFailure { .. }) => false,
            _ => true,
        }
    }
}
