//! Synchronization engine: owns one [Work] and drives TOC discovery, reconciliation and
//! per-chapter retrieval and decoding against a [ContentStore].
//!
//! Every operation persists the Work at its own end (bulk operations every `persist_every`
//! chapters as well), so an interrupted run only loses the chapters since the last write.

mod compile;
mod error;
mod reconcile;

pub use compile::{
    sanitize_title, volume_filename, volume_windows, VolumeReport, DEFAULT_CHAPTERS_PER_VOLUME,
    OUTPUT_DIR,
};
pub use error::SyncError;
pub use reconcile::{extract_links, reconcile, ReconcileReport};

use crate::decode::{host_of, normalize_host, DecodeGuide, Decoder, ProcessorRegistry};
use crate::fetch::{Fetcher, RequestPolicy};
use crate::model::{chapter_filename, Work, CHAPTERS_DIR, COVER_KEY, TOC_PREFIX};
use crate::store::{numbered_key, ContentStore, FileStore};
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_PERSIST_EVERY: usize = 10;

/// What a bulk run does when a chapter yields no content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFailurePolicy {
    /// Record the failure and continue with the next chapter.
    #[default]
    Skip,
    /// Stop the run at the first such chapter.
    Abort,
}

impl FromStr for ContentFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            _ => Err(format!(
                "invalid content failure policy '{}'; use skip or abort",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Persist the Work after this many processed chapters in bulk runs.
    pub persist_every: usize,
    pub on_content_failure: ContentFailurePolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            persist_every: DEFAULT_PERSIST_EVERY,
            on_content_failure: ContentFailurePolicy::Skip,
        }
    }
}

/// Shared, already-loaded collaborators for opening or creating a Work.
pub struct SyncContext {
    pub guide: Arc<DecodeGuide>,
    pub processors: Arc<ProcessorRegistry>,
    pub fetcher: Fetcher,
    /// Global policy; merged with the host's override.
    pub policy: RequestPolicy,
    pub options: SyncOptions,
}

/// Where a new Work's TOC comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TocSource {
    Url(String),
    /// A TOC document supplied by hand.
    Html(String),
}

/// A chapter addressed by URL or by 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterRef {
    Url(String),
    Ordinal(usize),
}

impl ChapterRef {
    /// Exactly one of `url` and `index` must be given.
    pub fn from_args(url: Option<String>, index: Option<usize>) -> Result<Self, SyncError> {
        match (url, index) {
            (Some(url), None) => Ok(ChapterRef::Url(url)),
            (None, Some(0)) => Err(SyncError::InvalidArgument {
                reason: "chapter index is 1-based".to_string(),
            }),
            (None, Some(index)) => Ok(ChapterRef::Ordinal(index)),
            (Some(_), Some(_)) => Err(SyncError::InvalidArgument {
                reason: "give either a chapter URL or a chapter index, not both".to_string(),
            }),
            (None, None) => Err(SyncError::InvalidArgument {
                reason: "a chapter URL or a chapter index is required".to_string(),
            }),
        }
    }
}

impl fmt::Display for ChapterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapterRef::Url(url) => f.write_str(url),
            ChapterRef::Ordinal(n) => write!(f, "#{}", n),
        }
    }
}

/// A materialized chapter, ready for the container writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedChapter {
    /// 1-based position in the Work.
    pub ordinal: usize,
    pub url: String,
    pub title: String,
    /// Decoded content with the title-in-content policy applied.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChapter {
    pub ordinal: usize,
    pub url: String,
    pub reason: String,
}

/// Outcome of a bulk run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: Vec<FailedChapter>,
}

/// Optional metadata changes; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub author: Option<String>,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub language: Option<String>,
    pub description: Option<String>,
}

type ProgressFn = Box<dyn FnMut(usize, usize)>;

/// One Work bound to its store, decoder and fetcher.
pub struct NovelSync<S: ContentStore = FileStore> {
    work: Work,
    store: S,
    decoder: Decoder,
    fetcher: Fetcher,
    guide: Arc<DecodeGuide>,
    processors: Arc<ProcessorRegistry>,
    base_policy: RequestPolicy,
    policy: RequestPolicy,
    options: SyncOptions,
    progress: Option<ProgressFn>,
}

impl<S: ContentStore> NovelSync<S> {
    /// Create a new Work in `store`. An existing Work is only replaced when `force` is set.
    ///
    /// The host comes from `host`, or else from the TOC URL; an HTML TOC needs an explicit host.
    pub fn create(
        ctx: SyncContext,
        store: S,
        title: &str,
        toc: TocSource,
        host: Option<&str>,
        force: bool,
    ) -> Result<Self, SyncError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::InvalidArgument {
                reason: "title must not be empty".to_string(),
            });
        }
        if !force && Work::load(&store)?.is_some() {
            return Err(SyncError::WorkExists {
                title: title.to_string(),
            });
        }
        let host = match (host, &toc) {
            (Some(h), _) => normalize_host(h),
            (None, TocSource::Url(url)) => host_of(url).ok_or_else(|| SyncError::InvalidArgument {
                reason: format!("cannot determine host from TOC URL {:?}", url),
            })?,
            (None, TocSource::Html(_)) => {
                return Err(SyncError::InvalidArgument {
                    reason: "a host is required when the TOC is given as HTML".to_string(),
                })
            }
        };
        let decoder = Decoder::new(&ctx.guide, &host, ctx.processors.clone())?;
        let work = Work::new(title, decoder.host());
        store.clear_numbered(TOC_PREFIX)?;

        let mut sync = Self::assemble(ctx, store, work, decoder);
        match toc {
            TocSource::Url(url) => {
                sync.work.toc_main_url = Some(sync.decoder.toc_main_url(&url)?);
            }
            TocSource::Html(html) => {
                sync.store.append_numbered(TOC_PREFIX, &html)?;
            }
        }
        sync.persist()?;
        tracing::info!(work = title, host = %sync.work.host, "work created");
        Ok(sync)
    }

    /// Open the Work persisted in `store`.
    pub fn open(ctx: SyncContext, store: S) -> Result<Self, SyncError> {
        let work = Work::load(&store)?.ok_or_else(|| SyncError::WorkNotFound {
            location: store.location(),
        })?;
        let decoder = Decoder::new(&ctx.guide, &work.host, ctx.processors.clone())?;
        Ok(Self::assemble(ctx, store, work, decoder))
    }

    fn assemble(ctx: SyncContext, store: S, work: Work, decoder: Decoder) -> Self {
        let policy = match decoder.request_override() {
            Some(o) => ctx.policy.merge(o),
            None => ctx.policy,
        };
        Self {
            work,
            store,
            decoder,
            fetcher: ctx.fetcher,
            guide: ctx.guide,
            processors: ctx.processors,
            base_policy: ctx.policy,
            policy,
            options: ctx.options,
            progress: None,
        }
    }

    pub fn work(&self) -> &Work {
        &self.work
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Effective request policy (global merged with the host override).
    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    /// Called with (done, total) after every chapter of a bulk run.
    pub fn set_progress(&mut self, f: impl FnMut(usize, usize) + 'static) {
        self.progress = Some(Box::new(f));
    }

    fn report_progress(&mut self, done: usize, total: usize) {
        if let Some(f) = self.progress.as_mut() {
            f(done, total);
        }
    }

    pub fn persist(&self) -> Result<(), SyncError> {
        self.work.save(&self.store)?;
        Ok(())
    }

    // --- work management ---

    fn rebind_host(&mut self, host: &str) -> Result<(), SyncError> {
        let decoder = Decoder::new(&self.guide, host, self.processors.clone())?;
        self.policy = match decoder.request_override() {
            Some(o) => self.base_policy.merge(o),
            None => self.base_policy,
        };
        self.work.host = decoder.host().to_string();
        self.decoder = decoder;
        Ok(())
    }

    /// Switch the Work to another host's decode rules.
    pub fn set_host(&mut self, host: &str) -> Result<(), SyncError> {
        self.rebind_host(host)?;
        self.persist()?;
        tracing::info!(work = %self.work.title(), host = %self.work.host, "host changed");
        Ok(())
    }

    /// Use `url` as the TOC source. Cached TOC pages are dropped.
    pub fn set_toc_main_url(&mut self, url: &str, host: Option<&str>) -> Result<(), SyncError> {
        if let Some(h) = host {
            self.rebind_host(h)?;
        }
        self.store.clear_numbered(TOC_PREFIX)?;
        self.work.toc_main_url = Some(self.decoder.toc_main_url(url)?);
        self.persist()
    }

    /// Add a hand-supplied TOC page. Replaces a URL-based TOC; otherwise appends a page.
    pub fn add_toc_html(&mut self, html: &str, host: Option<&str>) -> Result<usize, SyncError> {
        if let Some(h) = host {
            self.rebind_host(h)?;
        }
        if self.work.toc_main_url.take().is_some() {
            self.store.clear_numbered(TOC_PREFIX)?;
        }
        let index = self.store.append_numbered(TOC_PREFIX, html)?;
        self.persist()?;
        Ok(index)
    }

    /// Drop every cached TOC page; returns how many there were.
    pub fn clear_toc(&mut self) -> Result<usize, SyncError> {
        Ok(self.store.clear_numbered(TOC_PREFIX)?)
    }

    pub fn toc_page_count(&self) -> Result<usize, SyncError> {
        let mut n = 0;
        while self.store.exists(&numbered_key(TOC_PREFIX, n))? {
            n += 1;
        }
        Ok(n)
    }

    pub fn set_metadata(&mut self, update: MetadataUpdate) -> Result<(), SyncError> {
        let meta = &mut self.work.metadata;
        if let Some(author) = update.author {
            meta.author = Some(author);
        }
        if let Some(year) = update.start_year {
            meta.start_year = Some(year);
        }
        if let Some(year) = update.end_year {
            meta.end_year = Some(year);
        }
        if let Some(language) = update.language {
            meta.language = language;
        }
        if let Some(description) = update.description {
            meta.description = Some(description);
        }
        self.persist()
    }

    pub fn add_tag(&mut self, tag: &str) -> Result<bool, SyncError> {
        let added = self.work.add_tag(tag);
        if added {
            self.persist()?;
        }
        Ok(added)
    }

    pub fn remove_tag(&mut self, tag: &str) -> Result<bool, SyncError> {
        let removed = self.work.remove_tag(tag);
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn set_cover_image(&mut self, bytes: &[u8]) -> Result<(), SyncError> {
        if bytes.is_empty() {
            return Err(SyncError::InvalidArgument {
                reason: "cover image is empty".to_string(),
            });
        }
        self.store.save(COVER_KEY, bytes)?;
        self.persist()
    }

    pub fn cover_image(&self) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.store.load(COVER_KEY)?)
    }

    /// Clean cached chapter and TOC markup in place. Returns the number of files rewritten.
    pub fn clean_files(&mut self, hard: bool) -> Result<usize, SyncError> {
        let mut keys: Vec<String> = self
            .work
            .chapters
            .iter()
            .filter_map(|c| c.cache_key())
            .collect();
        let mut n = 0;
        while self.store.exists(&numbered_key(TOC_PREFIX, n))? {
            keys.push(numbered_key(TOC_PREFIX, n));
            n += 1;
        }
        let mut cleaned = 0;
        for key in keys {
            let Some(markup) = self.store.load_text(&key)? else {
                continue;
            };
            let out = self.decoder.clean_markup(&markup, hard);
            self.store.save_text(&key, &out)?;
            cleaned += 1;
        }
        tracing::info!(work = %self.work.title(), files = cleaned, hard, "cleaned cached markup");
        Ok(cleaned)
    }

    // --- TOC ---

    /// Refresh the chapter list from the TOC and reconcile it with the known chapters.
    ///
    /// TOC pages are fetched when `reload` is set or nothing is cached yet (URL sources only);
    /// otherwise the cached pages are decoded again.
    pub fn sync_toc(&mut self, reload: bool) -> Result<ReconcileReport, SyncError> {
        let pages = self.toc_pages(reload)?;
        let per_page = pages
            .iter()
            .map(|page| self.decoder.chapter_urls(page))
            .collect::<Result<Vec<_>, _>>()?;
        let host_prefix = self
            .decoder
            .add_host_to_chapter()
            .then(|| self.work.host.clone());
        let links = extract_links(
            per_page,
            self.decoder.is_index_inverted(),
            host_prefix.as_deref(),
        );
        if links.is_empty() {
            tracing::error!(work = %self.work.title(), host = %self.work.host, pages = pages.len(), "TOC yielded no chapter links");
            return Err(SyncError::NoChapterLinks {
                work: self.work.title().to_string(),
                host: self.work.host.clone(),
            });
        }

        let report = reconcile(&mut self.work.chapters, &links);
        self.work.chapter_url_list = links;
        self.persist()?;

        let still_used: HashSet<String> = self
            .work
            .chapters
            .iter()
            .filter_map(|c| c.cached_filename.clone())
            .collect();
        for chapter in &report.removed {
            if let Some(name) = chapter
                .cached_filename
                .as_ref()
                .filter(|n| !still_used.contains(*n))
            {
                self.store.delete(&format!("{}/{}", CHAPTERS_DIR, name))?;
            }
        }
        tracing::info!(
            work = %self.work.title(),
            chapters = self.work.chapters.len(),
            added = report.added.len(),
            removed = report.removed.len(),
            "TOC synchronized"
        );
        Ok(report)
    }

    fn toc_pages(&mut self, reload: bool) -> Result<Vec<String>, SyncError> {
        let cached = self.store.list_ordered_by_prefix(TOC_PREFIX)?;
        match self.work.toc_main_url.clone() {
            Some(url) if reload || cached.is_empty() => self.fetch_toc_chain(&url),
            _ if cached.is_empty() => Err(SyncError::NoTocSource {
                work: self.work.title().to_string(),
            }),
            _ => Ok(cached),
        }
    }

    /// Fetch the TOC starting at `start`, following `next_page` while the host paginates.
    /// The page cache is only replaced once the whole chain was fetched.
    fn fetch_toc_chain(&mut self, start: &str) -> Result<Vec<String>, SyncError> {
        let mut pages = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(start.to_string());
        while let Some(url) = next.take() {
            visited.insert(url.clone());
            let page = match self.fetcher.fetch(&url, &self.policy) {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(work = %self.work.title(), url = %url, error = %e, "TOC page fetch failed; aborting sync");
                    return Err(e.into());
                }
            };
            tracing::debug!(work = %self.work.title(), url = %url, page = pages.len(), "TOC page fetched");
            if self.decoder.has_pagination() {
                if let Some(link) = self.decoder.next_page_url(&page)? {
                    let resolved = resolve_link(&url, &link);
                    if visited.contains(&resolved) {
                        tracing::debug!(url = %resolved, "next TOC page already visited; stopping");
                    } else {
                        next = Some(resolved);
                    }
                }
            }
            pages.push(page);
        }
        self.store.clear_numbered(TOC_PREFIX)?;
        for page in &pages {
            self.store.append_numbered(TOC_PREFIX, page)?;
        }
        Ok(pages)
    }

    // --- chapters ---

    fn position(&self, chapter: &ChapterRef) -> Result<usize, SyncError> {
        let found = match chapter {
            ChapterRef::Url(url) => self.work.chapter_position(url.trim()),
            ChapterRef::Ordinal(n) => n
                .checked_sub(1)
                .filter(|i| *i < self.work.chapters.len()),
        };
        found.ok_or_else(|| SyncError::ChapterNotFound {
            work: self.work.title().to_string(),
            reference: chapter.to_string(),
        })
    }

    fn is_cached(&self, pos: usize) -> Result<bool, SyncError> {
        match self.work.chapters[pos].cache_key() {
            Some(key) => Ok(self.store.exists(&key)?),
            None => Ok(false),
        }
    }

    /// Markup of the chapter at `pos`: from the cache unless `reload`, else fetched and cached.
    fn chapter_markup(&mut self, pos: usize, reload: bool) -> Result<String, SyncError> {
        let chapter = &self.work.chapters[pos];
        let url = chapter.url.clone();
        if !reload {
            if let Some(key) = chapter.cache_key() {
                if let Some(markup) = self.store.load_text(&key)? {
                    return Ok(markup);
                }
            }
        }
        let markup = self.fetcher.fetch(&url, &self.policy)?;
        let filename = self.work.chapters[pos]
            .cached_filename
            .clone()
            .unwrap_or_else(|| chapter_filename(&url));
        self.store
            .save_text(&format!("{}/{}", CHAPTERS_DIR, filename), &markup)?;
        self.work.chapters[pos].cached_filename = Some(filename);
        Ok(markup)
    }

    fn materialize(&mut self, pos: usize, reload: bool) -> Result<ScrapedChapter, SyncError> {
        let markup = self.chapter_markup(pos, reload)?;
        let url = self.work.chapters[pos].url.clone();
        let title = self
            .decoder
            .chapter_title(&markup)?
            .unwrap_or_else(|| format!("{} Chapter {}", self.work.title(), pos + 1));
        let Some(content) = self.decoder.chapter_content(&markup)? else {
            tracing::warn!(work = %self.work.title(), url = %url, "no content found in chapter");
            return Err(SyncError::ContentExtraction {
                work: self.work.title().to_string(),
                url,
            });
        };
        let content = self.decoder.title_in_content().apply(&title, &content);
        self.work.chapters[pos].title = Some(title.clone());
        Ok(ScrapedChapter {
            ordinal: pos + 1,
            url,
            title,
            content,
        })
    }

    /// Fetch (cache-first unless `reload`) and decode one chapter, then persist the Work.
    pub fn scrap_chapter(
        &mut self,
        chapter: &ChapterRef,
        reload: bool,
    ) -> Result<ScrapedChapter, SyncError> {
        let pos = self.position(chapter)?;
        let result = self.materialize(pos, reload);
        self.persist()?;
        if let Err(e) = &result {
            tracing::error!(work = %self.work.title(), chapter = %chapter, error = %e, "scrap_chapter failed");
        }
        result
    }

    /// Record a per-chapter failure, or return it when the run has to stop.
    fn record_failure(
        &self,
        report: &mut BatchReport,
        pos: usize,
        error: SyncError,
    ) -> Result<(), SyncError> {
        let url = self.work.chapters[pos].url.clone();
        let abort = error.is_fatal_to_batch()
            || (matches!(error, SyncError::ContentExtraction { .. })
                && self.options.on_content_failure == ContentFailurePolicy::Abort);
        if abort {
            tracing::error!(work = %self.work.title(), url = %url, error = %error, "stopping bulk run");
            self.persist()?;
            return Err(error);
        }
        tracing::warn!(work = %self.work.title(), url = %url, error = %error, "chapter failed; continuing");
        report.failed.push(FailedChapter {
            ordinal: pos + 1,
            url,
            reason: error.to_string(),
        });
        Ok(())
    }

    /// Drive `step` over every chapter, persisting every `persist_every` processed ones.
    fn run_batch(
        &mut self,
        mut skip: impl FnMut(&Self, usize) -> Result<bool, SyncError>,
        mut step: impl FnMut(&mut Self, usize) -> Result<(), SyncError>,
    ) -> Result<BatchReport, SyncError> {
        let total = self.work.chapters.len();
        let every = self.options.persist_every.max(1);
        let mut report = BatchReport::default();
        let mut since_persist = 0;
        for pos in 0..total {
            if skip(&*self, pos)? {
                report.skipped += 1;
            } else {
                match step(&mut *self, pos) {
                    Ok(()) => report.processed += 1,
                    Err(e) => self.record_failure(&mut report, pos, e)?,
                }
                since_persist += 1;
            }
            self.report_progress(pos + 1, total);
            if since_persist >= every {
                self.persist()?;
                since_persist = 0;
            }
        }
        self.persist()?;
        tracing::info!(
            work = %self.work.title(),
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed.len(),
            "bulk run finished"
        );
        Ok(report)
    }

    /// Make sure every chapter's markup is cached. Cached chapters are skipped unless `reload`.
    pub fn request_all(&mut self, reload: bool) -> Result<BatchReport, SyncError> {
        self.run_batch(
            |this, pos| Ok(!reload && this.is_cached(pos)?),
            |this, pos| this.chapter_markup(pos, reload).map(|_| ()),
        )
    }

    /// Fetch and decode every chapter. Chapters already cached and titled are skipped unless
    /// `redecode`; `refetch` also bypasses the markup cache.
    pub fn scrap_all(&mut self, redecode: bool, refetch: bool) -> Result<BatchReport, SyncError> {
        self.run_batch(
            |this, pos| {
                Ok(!redecode
                    && !refetch
                    && this.work.chapters[pos].title.is_some()
                    && this.is_cached(pos)?)
            },
            |this, pos| this.materialize(pos, refetch).map(|_| ()),
        )
    }
}

/// Resolve a possibly relative `link` found on page `base`.
fn resolve_link(base: &str, link: &str) -> String {
    Url::parse(base)
        .and_then(|b| b.join(link))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| link.to_string())
}
