//! Persistent model of one scraped work.
//!
//! The whole [Work] is written to `data/main.json` after every mutation; cached markup lives
//! next to it under keys derived from chapter URLs.

use crate::store::{ContentStore, StoreError};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Store key of the Work record.
pub const WORK_KEY: &str = "data/main.json";
/// Prefix of cached TOC pages (`data/toc_0.html`, …).
pub const TOC_PREFIX: &str = "data/toc";
/// Directory for cached chapter markup.
pub const CHAPTERS_DIR: &str = "data/chapters";
/// Store key of the cover image.
pub const COVER_KEY: &str = "data/cover";

const MAX_FILENAME_BASE: usize = 50;

#[derive(Debug, Error)]
pub enum WorkRecordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Work record {key} is not valid JSON: {source}")]
    Corrupt {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Metadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: None,
            start_year: None,
            end_year: None,
            language: default_language(),
            description: None,
            tags: Vec::new(),
        }
    }
}

/// One chapter. Identity is the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub url: String,
    /// Name of the cached markup file under `data/chapters/`, set once fetched.
    #[serde(default)]
    pub cached_filename: Option<String>,
    /// Decoded (or generated) title, set once materialized.
    #[serde(default)]
    pub title: Option<String>,
}

impl Chapter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cached_filename: None,
            title: None,
        }
    }

    /// Store key of the cached markup, if any.
    pub fn cache_key(&self) -> Option<String> {
        self.cached_filename
            .as_ref()
            .map(|f| format!("{}/{}", CHAPTERS_DIR, f))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Work {
    pub metadata: Metadata,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    /// Source of the TOC. None when the TOC was supplied as ad-hoc documents.
    #[serde(default)]
    pub toc_main_url: Option<String>,
    /// Authoritative chapter link list from the last TOC sync.
    #[serde(default)]
    pub chapter_url_list: Vec<String>,
    pub host: String,
}

impl Work {
    pub fn new(title: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(title),
            chapters: Vec::new(),
            toc_main_url: None,
            chapter_url_list: Vec::new(),
            host: host.into(),
        }
    }

    pub fn title(&self) -> &str {
        &self.metadata.title
    }

    pub fn load(store: &(impl ContentStore + ?Sized)) -> Result<Option<Self>, WorkRecordError> {
        let Some(bytes) = store.load(WORK_KEY)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| WorkRecordError::Corrupt {
                key: WORK_KEY,
                source: e,
            })
    }

    pub fn save(&self, store: &(impl ContentStore + ?Sized)) -> Result<(), WorkRecordError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| WorkRecordError::Corrupt {
            key: WORK_KEY,
            source: e,
        })?;
        store.save(WORK_KEY, &json)?;
        Ok(())
    }

    /// Position of the chapter with `url`.
    pub fn chapter_position(&self, url: &str) -> Option<usize> {
        self.chapters.iter().position(|c| c.url == url)
    }

    /// Add a tag unless already present. Returns whether it was added.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.metadata.tags.iter().any(|t| t == tag) {
            return false;
        }
        self.metadata.tags.push(tag.to_string());
        true
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.metadata.tags.len();
        self.metadata.tags.retain(|t| t != tag.trim());
        before != self.metadata.tags.len()
    }
}

/// Cache filename for a chapter URL: last two path segments, sanitized and truncated, plus
/// the first 8 hex digits of the URL's SHA-256.
pub fn chapter_filename(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    let tail = &parts[parts.len().saturating_sub(2)..];
    let joined = tail.join("_");
    let mut base: String = joined
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_BASE)
        .collect();
    if base.is_empty() {
        base.push_str("index");
    }
    let digest = Sha256::digest(url.as_bytes());
    let hash = hex::encode(digest);
    format!("{}_{}.html", base, &hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::error::Error;

    fn sample_work() -> Work {
        let mut work = Work::new("Mother of Learning", "royalroad.com");
        work.metadata.author = Some("nobody103".to_string());
        work.metadata.start_year = Some(2011);
        work.metadata.tags = vec!["fantasy".to_string(), "time loop".to_string()];
        work.toc_main_url = Some("https://www.royalroad.com/fiction/21220".to_string());
        work.chapter_url_list = vec![
            "https://www.royalroad.com/fiction/21220/chapter/1".to_string(),
            "https://www.royalroad.com/fiction/21220/chapter/2".to_string(),
        ];
        work.chapters = vec![
            Chapter {
                url: work.chapter_url_list[0].clone(),
                cached_filename: Some(chapter_filename(&work.chapter_url_list[0])),
                title: Some("1. Good Morning Brother".to_string()),
            },
            Chapter::new(work.chapter_url_list[1].clone()),
        ];
        work
    }

    #[test]
    fn work_round_trips_through_store() -> Result<(), Box<dyn Error>> {
        let store = MemoryStore::new();
        assert_eq!(Work::load(&store)?, None);
        let work = sample_work();
        work.save(&store)?;
        assert_eq!(Work::load(&store)?, Some(work));
        Ok(())
    }

    #[test]
    fn missing_optional_fields_take_defaults() -> Result<(), Box<dyn Error>> {
        let work: Work = serde_json::from_str(
            r#"{"metadata": {"title": "T"}, "host": "a.com"}"#,
        )?;
        assert_eq!(work.metadata.language, "en");
        assert!(work.chapters.is_empty());
        assert_eq!(work.toc_main_url, None);
        Ok(())
    }

    #[test]
    fn corrupt_record_is_reported() -> Result<(), String> {
        let store = MemoryStore::new();
        store.save(WORK_KEY, b"{not json").map_err(|e| e.to_string())?;
        match Work::load(&store) {
            Err(WorkRecordError::Corrupt { .. }) => Ok(()),
            other => Err(format!("expected Corrupt, got {:?}", other)),
        }
    }

    #[test]
    fn chapter_filename_uses_last_two_segments() {
        let name = chapter_filename("https://example.com/novel/my-novel/chapter-12/");
        assert!(name.starts_with("my-novel_chapter-12_"), "{}", name);
        assert!(name.ends_with(".html"));
        assert_eq!(name.len(), "my-novel_chapter-12_".len() + 8 + ".html".len());
    }

    #[test]
    fn chapter_filename_sanitizes_and_truncates() {
        let long = format!("https://example.com/a.b/{}?x=1", "c".repeat(80));
        let name = chapter_filename(&long);
        let base = &name[..name.len() - "_12345678.html".len()];
        assert_eq!(base.len(), 50);
        assert!(base.starts_with("a_b_ccc"));
        assert_eq!(chapter_filename("https://example.com/").split('_').next(), Some("index"));
    }

    #[test]
    fn chapter_filename_differs_per_url() {
        assert_ne!(
            chapter_filename("https://a.com/n/1?page=1"),
            chapter_filename("https://a.com/n/1?page=2")
        );
    }

    #[test]
    fn tags_have_no_duplicates() {
        let mut work = sample_work();
        assert!(!work.add_tag("fantasy"));
        assert!(work.add_tag("magic"));
        assert!(work.remove_tag("fantasy"));
        assert!(!work.remove_tag("fantasy"));
        assert_eq!(work.metadata.tags, vec!["time loop", "magic"]);
    }
}
