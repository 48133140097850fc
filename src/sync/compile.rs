//! Compilation of a Work into fixed-size EPUB volumes.

use super::{FailedChapter, NovelSync, SyncError};
use crate::epub::{write_epub, EpubOptions, Series, Volume, VolumeChapter};
use crate::store::ContentStore;
use sha2::{Digest, Sha256};
use std::io::Cursor;

pub const DEFAULT_CHAPTERS_PER_VOLUME: usize = 100;

/// Store directory for compiled volumes.
pub const OUTPUT_DIR: &str = "output";

/// One written volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeReport {
    /// 1-based series index.
    pub index: usize,
    /// First and last chapter ordinal, inclusive.
    pub start: usize,
    pub end: usize,
    pub filename: String,
    /// Store key the file was written under.
    pub key: String,
    pub chapters: usize,
    pub skipped: Vec<FailedChapter>,
}

/// Inclusive 1-based (start, end) windows of `size` chapters covering `total` chapters.
pub fn volume_windows(total: usize, size: usize) -> Vec<(usize, usize)> {
    let size = size.max(1);
    let mut windows = Vec::new();
    let mut start = 1;
    while start <= total {
        let end = start.saturating_add(size - 1).min(total);
        windows.push((start, end));
        start = end + 1;
    }
    windows
}

/// Lowercase alphanumerics with single dashes in between; "book" when nothing is left.
pub fn sanitize_title(title: &str) -> String {
    let mut s = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();
    while s.contains("--") {
        s = s.replace("--", "-");
    }
    s = s.trim_matches('-').to_string();
    if s.is_empty() {
        s = "book".to_string();
    }
    s
}

pub fn volume_filename(title: &str, start: usize, end: usize) -> String {
    format!("{}-chapters-{}-{}.epub", sanitize_title(title), start, end)
}

fn volume_identifier(work: &str, host: &str, start: usize, end: usize) -> String {
    let digest = Sha256::digest(format!("{}|{}|{}-{}", host, work, start, end).as_bytes());
    format!("urn:wnscrape:{}", &hex::encode(digest)[..16])
}

impl<S: ContentStore> NovelSync<S> {
    /// Compile chapters `start..start + count` (1-based) into one volume.
    ///
    /// Returns `None` when `start` lies past the last chapter or when no chapter of the window
    /// could be materialized. Chapters that fail with a per-chapter error are left out.
    pub fn save_volume(
        &mut self,
        start: usize,
        count: usize,
        series_index: usize,
        options: &EpubOptions,
    ) -> Result<Option<VolumeReport>, SyncError> {
        let total = self.work.chapters.len();
        if start == 0 || count == 0 {
            return Err(SyncError::InvalidArgument {
                reason: "volume start and size must be at least 1".to_string(),
            });
        }
        if start > total {
            tracing::warn!(work = %self.work.title(), start, chapters = total, "volume starts past the last chapter; skipping");
            return Ok(None);
        }
        let end = start.saturating_add(count - 1).min(total);

        let mut chapters = Vec::with_capacity(end + 1 - start);
        let mut skipped = Vec::new();
        for pos in start - 1..end {
            match self.materialize(pos, false) {
                Ok(ch) => chapters.push(VolumeChapter {
                    title: ch.title,
                    body: ch.content,
                }),
                Err(e) if !e.is_fatal_to_batch() => {
                    let url = self.work.chapters[pos].url.clone();
                    tracing::warn!(work = %self.work.title(), url = %url, error = %e, "leaving chapter out of volume");
                    skipped.push(FailedChapter {
                        ordinal: pos + 1,
                        url,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    self.persist()?;
                    return Err(e);
                }
            }
            self.report_progress(pos + 2 - start, end + 1 - start);
        }
        self.persist()?;
        if chapters.is_empty() {
            tracing::warn!(work = %self.work.title(), start, end, "no chapter of the volume could be built; no file written");
            return Ok(None);
        }

        let meta = &self.work.metadata;
        let volume = Volume {
            identifier: volume_identifier(&meta.title, &self.work.host, start, end),
            title: format!("{} Chapters {} - {}", meta.title, start, end),
            author: meta.author.clone(),
            language: meta.language.clone(),
            description: meta.description.clone(),
            subjects: meta.tags.clone(),
            start_year: meta.start_year,
            end_year: meta.end_year,
            series: Some(Series {
                name: meta.title.clone(),
                index: series_index,
            }),
            cover: self.cover_image()?,
            chapters,
        };
        let bytes = write_epub(&volume, Cursor::new(Vec::new()), options)?.into_inner();
        let filename = volume_filename(&meta.title, start, end);
        let key = format!("{}/{}", OUTPUT_DIR, filename);
        self.store.save(&key, &bytes)?;
        tracing::info!(work = %meta.title, file = %filename, chapters = volume.chapters.len(), skipped = skipped.len(), "volume written");
        Ok(Some(VolumeReport {
            index: series_index,
            start,
            end,
            filename,
            key,
            chapters: volume.chapters.len(),
            skipped,
        }))
    }

    /// Compile the whole Work, `per_volume` chapters per file.
    pub fn save_all_volumes(
        &mut self,
        per_volume: usize,
        options: &EpubOptions,
    ) -> Result<Vec<VolumeReport>, SyncError> {
        let windows = volume_windows(self.work.chapters.len(), per_volume);
        let mut written = Vec::with_capacity(windows.len());
        for (i, (start, end)) in windows.into_iter().enumerate() {
            if let Some(report) = self.save_volume(start, end + 1 - start, i + 1, options)? {
                written.push(report);
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeGuide, ProcessorRegistry};
    use crate::fetch::{Fetcher, RequestPolicy};
    use crate::model::{chapter_filename, CHAPTERS_DIR};
    use crate::store::MemoryStore;
    use crate::sync::{SyncContext, SyncOptions, TocSource};
    use std::sync::Arc;
    use zip::ZipArchive;

    #[test]
    fn windows_cover_every_chapter() {
        assert!(volume_windows(0, 100).is_empty());
        assert_eq!(volume_windows(100, 100), vec![(1, 100)]);
        assert_eq!(volume_windows(101, 100), vec![(1, 100), (101, 101)]);
        assert_eq!(volume_windows(5, 2), vec![(1, 2), (3, 4), (5, 5)]);
        assert_eq!(volume_windows(3, 0), vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn sanitize_title_empty() {
        assert_eq!(sanitize_title(""), "book");
        assert_eq!(sanitize_title("!!!"), "book");
    }

    #[test]
    fn sanitize_title_spaces_and_special_to_dashes() {
        assert_eq!(sanitize_title("My  Story!"), "my-story");
        assert_eq!(sanitize_title("  --  a  --  b  --  "), "a-b");
    }

    #[test]
    fn filenames_carry_the_range() {
        assert_eq!(
            volume_filename("The Wandering Inn", 101, 200),
            "the-wandering-inn-chapters-101-200.epub"
        );
    }

    const GUIDE: &str = r#"[{
        "host": "test.com",
        "title": {"selector": "h1", "extract": {"type": "text"}},
        "content": {"selector": "p", "array": true},
        "index": {"selector": "a", "extract": {"type": "attr", "key": "href"}, "array": true},
        "add_host_to_chapter": true,
        "title_in_content": "NO"
    }]"#;

    fn three_chapter_work() -> Result<NovelSync<MemoryStore>, SyncError> {
        let ctx = SyncContext {
            guide: Arc::new(DecodeGuide::from_json(GUIDE)?),
            processors: Arc::new(ProcessorRegistry::new()),
            fetcher: Fetcher::builder().secondary_fetch(false).build()?,
            policy: RequestPolicy::default(),
            options: SyncOptions::default(),
        };
        let toc = r#"<a href="/1">1</a><a href="/2">2</a><a href="/3">3</a>"#;
        let mut sync = NovelSync::create(
            ctx,
            MemoryStore::new(),
            "Small Work",
            TocSource::Html(toc.to_string()),
            Some("test.com"),
            false,
        )?;
        sync.sync_toc(false)?;
        for (pos, body) in ["<h1>One</h1><p>a</p>", "<h1>Two</h1>", "<h1>Three</h1><p>c</p>"]
            .into_iter()
            .enumerate()
        {
            let name = chapter_filename(&sync.work.chapters[pos].url);
            sync.store
                .save_text(&format!("{}/{}", CHAPTERS_DIR, name), body)?;
            sync.work.chapters[pos].cached_filename = Some(name);
        }
        Ok(sync)
    }

    #[test]
    fn volumes_skip_failed_chapters() -> Result<(), Box<dyn std::error::Error>> {
        let mut sync = three_chapter_work()?;
        let reports = sync.save_all_volumes(2, &EpubOptions::default())?;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].filename, "small-work-chapters-1-2.epub");
        assert_eq!(reports[0].chapters, 1);
        assert_eq!(reports[0].skipped.len(), 1);
        assert_eq!(reports[0].skipped[0].ordinal, 2);
        assert_eq!(reports[1].index, 2);
        assert_eq!((reports[1].start, reports[1].end), (3, 3));

        let bytes = sync
            .store()
            .load(&reports[0].key)?
            .ok_or("volume not stored")?;
        let mut zip = ZipArchive::new(Cursor::new(bytes))?;
        let mut opf = String::new();
        std::io::Read::read_to_string(&mut zip.by_name("OEBPS/content.opf")?, &mut opf)?;
        assert!(opf.contains("Small Work Chapters 1 - 2"));
        assert!(opf.contains("calibre:series"));
        Ok(())
    }

    #[test]
    fn volume_past_the_end_is_skipped() -> Result<(), SyncError> {
        let mut sync = three_chapter_work()?;
        assert_eq!(sync.save_volume(4, 2, 3, &EpubOptions::default())?, None);
        assert!(matches!(
            sync.save_volume(0, 2, 1, &EpubOptions::default()),
            Err(SyncError::InvalidArgument { .. })
        ));
        Ok(())
    }

    #[test]
    fn oversized_volume_covers_the_rest() -> Result<(), String> {
        assert_eq!(volume_windows(3, usize::MAX), vec![(1, 3)]);
        let mut sync = three_chapter_work().map_err(|e| e.to_string())?;
        match sync.save_volume(3, usize::MAX, 1, &EpubOptions::default()) {
            Ok(Some(report)) if (report.start, report.end, report.chapters) == (3, 3, 1) => Ok(()),
            other => Err(format!("expected volume 3-3, got {:?}", other)),
        }
    }

    #[test]
    fn window_of_only_failures_writes_nothing() -> Result<(), SyncError> {
        let mut sync = three_chapter_work()?;
        assert_eq!(sync.save_volume(2, 1, 1, &EpubOptions::default())?, None);
        assert!(sync.store().keys().iter().all(|k| !k.starts_with(OUTPUT_DIR)));
        Ok(())
    }
}
