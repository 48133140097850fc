//! CLI parsing and orchestration. One subcommand per Work operation; maps errors to exit codes.

use crate::config::{self, Config};
use crate::decode::{DecodeError, DecodeGuide, ProcessorRegistry};
use crate::epub::{EpubOptions, EpubVersion};
use crate::fetch::{FetchError, Fetcher};
use crate::store::{ContentStore, FileStore};
use crate::sync::{
    sanitize_title, BatchReport, ChapterRef, ContentFailurePolicy, MetadataUpdate, NovelSync,
    SyncContext, SyncError, TocSource, VolumeReport, DEFAULT_CHAPTERS_PER_VOLUME,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DATA_DIR: &str = "novels";

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Sync(#[from] SyncError),

    #[error("{0}")]
    Output(String),
}

impl From<DecodeError> for CliRunError {
    fn from(e: DecodeError) -> Self {
        CliRunError::Sync(SyncError::Decode(e))
    }
}

impl From<FetchError> for CliRunError {
    fn from(e: FetchError) -> Self {
        CliRunError::Sync(SyncError::Fetch(e))
    }
}

impl CliRunError {
    /// 1 usage or configuration, 2 network or extraction, 3 output.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Output(_) => 3,
            CliRunError::Sync(e) => match e {
                SyncError::Fetch(FetchError::Client { .. }) => 1,
                SyncError::Fetch(_)
                | SyncError::ContentExtraction { .. }
                | SyncError::NoChapterLinks { .. }
                | SyncError::Decode(DecodeError::ParseFailure { .. }) => 2,
                SyncError::Store(_) | SyncError::Record(_) | SyncError::Epub(_) => 3,
                _ => 1,
            },
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "wnscrape")]
#[command(about = "Keep web novels in sync with their source sites and compile them to EPUB")]
#[command(
    after_help = "Config file keys (data_dir, decode_guide, proxy_url, secondary_fetch, user_agent, request_delay_secs, timeout_secs, retry_count, time_between_retries_secs, force_secondary_fetch, persist_every, chapters_per_volume, on_content_failure, toc_page) are read from ./wnscrape.toml or the user config dir. CLI flags override config."
)]
pub struct Args {
    /// Only warnings and errors; no progress bars.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Debug logging and the full error chain on failure.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Directory holding one subdirectory per novel (overrides config; default ./novels).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Decode guide JSON file (overrides config; the bundled guide is used otherwise).
    #[arg(long, global = true)]
    pub decode_guide: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a novel from a TOC URL or a saved TOC page.
    CreateNovel {
        title: String,
        /// Table of contents URL; the host is taken from it unless --host is given.
        #[arg(long, conflicts_with = "toc_html", required_unless_present = "toc_html")]
        toc_url: Option<String>,
        /// Saved TOC page to use instead of a URL (requires --host).
        #[arg(long)]
        toc_html: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        /// Replace an existing novel of the same title.
        #[arg(long)]
        force: bool,
    },
    /// Point the novel at a new TOC URL. Cached TOC pages are dropped.
    SetTocUrl {
        title: String,
        url: String,
        #[arg(long)]
        host: Option<String>,
    },
    /// Add a saved TOC page. Replaces a TOC URL; repeated calls add further pages.
    AddTocHtml {
        title: String,
        file: PathBuf,
        #[arg(long)]
        host: Option<String>,
    },
    /// Refresh the chapter list from the TOC.
    SyncToc {
        title: String,
        /// Fetch the TOC again instead of using cached pages.
        #[arg(long)]
        reload: bool,
    },
    /// Print metadata, TOC source and chapter states.
    Show { title: String },
    /// Download every chapter that is not cached yet.
    RequestAll {
        title: String,
        /// Download cached chapters again as well.
        #[arg(long)]
        reload: bool,
    },
    /// Fetch and decode one chapter and print its HTML.
    ScrapChapter {
        title: String,
        #[arg(long, conflicts_with = "index")]
        url: Option<String>,
        /// 1-based chapter position.
        #[arg(long)]
        index: Option<usize>,
        #[arg(long)]
        reload: bool,
        /// Write the chapter HTML here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch and decode every chapter.
    ScrapAll {
        title: String,
        /// Decode chapters that already have a title again.
        #[arg(long)]
        redecode: bool,
        /// Download chapters again before decoding.
        #[arg(long)]
        refetch: bool,
        /// skip (default) or abort on chapters without content (overrides config).
        #[arg(long)]
        on_content_failure: Option<ContentFailurePolicy>,
    },
    /// Compile the novel into EPUB volumes.
    SaveEpub {
        title: String,
        /// Chapters per volume (overrides config; default 100).
        #[arg(long)]
        chapters_per_volume: Option<usize>,
        /// Only build the volume starting at this chapter (1-based).
        #[arg(long)]
        start: Option<usize>,
        /// Generate EPUB 2 instead of EPUB 3.
        #[arg(long)]
        epub_2: bool,
        /// Include toc.ncx in EPUB 3 output for legacy readers.
        #[arg(long)]
        ncx: bool,
        /// Leave out the visible table-of-contents page.
        #[arg(long)]
        no_toc_page: bool,
        /// Also copy the volumes into this directory.
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Update metadata fields; omitted fields stay as they are.
    SetMetadata {
        title: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        start_year: Option<i32>,
        #[arg(long)]
        end_year: Option<i32>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    AddTag { title: String, tag: String },
    RemoveTag { title: String, tag: String },
    /// Use an image file as the cover.
    SetCover { title: String, file: PathBuf },
    /// Switch the novel to another host's decode rules.
    SetHost { title: String, host: String },
    /// Strip unwanted tags from cached chapter and TOC markup.
    CleanFiles {
        title: String,
        /// Also remove structural and media tags.
        #[arg(long)]
        hard: bool,
    },
    /// List the hosts known to the decode guide.
    Hosts,
}

impl Command {
    fn title(&self) -> Option<&str> {
        match self {
            Command::CreateNovel { title, .. }
            | Command::SetTocUrl { title, .. }
            | Command::AddTocHtml { title, .. }
            | Command::SyncToc { title, .. }
            | Command::Show { title }
            | Command::RequestAll { title, .. }
            | Command::ScrapChapter { title, .. }
            | Command::ScrapAll { title, .. }
            | Command::SaveEpub { title, .. }
            | Command::SetMetadata { title, .. }
            | Command::AddTag { title, .. }
            | Command::RemoveTag { title, .. }
            | Command::SetCover { title, .. }
            | Command::SetHost { title, .. }
            | Command::CleanFiles { title, .. } => Some(title.as_str()),
            Command::Hosts => None,
        }
    }
}

/// Directory of the novel titled `title`.
pub fn work_dir(data_dir: &Path, title: &str) -> PathBuf {
    data_dir.join(sanitize_title(title))
}

fn read_input(path: &Path) -> Result<Vec<u8>, CliRunError> {
    std::fs::read(path)
        .map_err(|e| CliRunError::InvalidInput(format!("Cannot read {}: {}", path.display(), e)))
}

/// Ensure the output directory exists.
fn validate_output_dir(path: &Path) -> Result<(), CliRunError> {
    if !path.is_dir() {
        return Err(CliRunError::InvalidInput(format!(
            "Cannot write output: {}: directory does not exist.",
            path.display()
        )));
    }
    Ok(())
}

fn progress_bar(quiet: bool, message: &'static str) -> Option<indicatif::ProgressBar> {
    if quiet {
        return None;
    }
    let bar = indicatif::ProgressBar::new(0);
    if let Ok(style) = indicatif::ProgressStyle::default_bar()
        .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
    {
        bar.set_style(
            style
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );
    }
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(80));
    Some(bar)
}

fn attach_progress(sync: &mut NovelSync, bar: &Option<indicatif::ProgressBar>) {
    if let Some(bar) = bar.clone() {
        sync.set_progress(move |done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        });
    }
}

fn finish_progress(bar: Option<indicatif::ProgressBar>) {
    if let Some(bar) = bar {
        bar.disable_steady_tick();
        bar.finish_and_clear();
    }
}

fn print_batch(quiet: bool, what: &str, report: &BatchReport) {
    if quiet && report.failed.is_empty() {
        return;
    }
    eprintln!(
        "{}: {} processed, {} already done, {} failed",
        what,
        report.processed,
        report.skipped,
        report.failed.len()
    );
    for failed in &report.failed {
        eprintln!("  #{} {}: {}", failed.ordinal, failed.url, failed.reason);
    }
}

fn load_guide(args: &Args, config: &Config) -> Result<DecodeGuide, CliRunError> {
    let path = args
        .decode_guide
        .clone()
        .or_else(|| config.decode_guide.clone());
    let guide = match path {
        Some(path) => DecodeGuide::from_file(&path)?,
        None => DecodeGuide::bundled()?,
    };
    Ok(guide)
}

fn build_context(args: &Args, config: &Config) -> Result<SyncContext, CliRunError> {
    let guide = load_guide(args, config)?;
    let mut builder = Fetcher::builder()
        .secondary_fetch(config.secondary_fetch.unwrap_or(true))
        .delay_secs(config.request_delay_secs.unwrap_or(0));
    if let Some(ua) = &config.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    if let Some(url) = &config.proxy_url {
        builder = builder.proxy_url(url.clone());
    }
    Ok(SyncContext {
        guide: Arc::new(guide),
        processors: Arc::new(ProcessorRegistry::with_builtin()),
        fetcher: builder.build()?,
        policy: config.request_policy(),
        options: config.sync_options(),
    })
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(args: &Args) -> Result<(), CliRunError> {
    let mut config = config::load_config()
        .map_err(CliRunError::InvalidInput)?
        .unwrap_or_default();
    config.apply_env(|key| std::env::var(key).ok());

    let mut ctx = build_context(args, &config)?;
    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    let Some(title) = args.command.title() else {
        for host in ctx.guide.hosts() {
            println!("{}", host);
        }
        return Ok(());
    };
    let store = FileStore::new(work_dir(&data_dir, title));

    match &args.command {
        Command::CreateNovel {
            toc_url,
            toc_html,
            host,
            force,
            ..
        } => {
            let toc = match (toc_url, toc_html) {
                (Some(url), _) => TocSource::Url(url.clone()),
                (None, Some(path)) => {
                    TocSource::Html(String::from_utf8_lossy(&read_input(path)?).into_owned())
                }
                (None, None) => {
                    return Err(CliRunError::InvalidInput(
                        "Give the TOC as --toc-url or --toc-html.".to_string(),
                    ))
                }
            };
            let sync = NovelSync::create(ctx, store, title, toc, host.as_deref(), *force)?;
            if !args.quiet {
                eprintln!(
                    "Created '{}' ({}) in {}",
                    sync.work().title(),
                    sync.work().host,
                    sync.store().location()
                );
            }
        }
        Command::SetTocUrl { url, host, .. } => {
            let mut sync = NovelSync::open(ctx, store)?;
            sync.set_toc_main_url(url, host.as_deref())?;
        }
        Command::AddTocHtml { file, host, .. } => {
            let html = String::from_utf8_lossy(&read_input(file)?).into_owned();
            let mut sync = NovelSync::open(ctx, store)?;
            let index = sync.add_toc_html(&html, host.as_deref())?;
            if !args.quiet {
                eprintln!("Stored TOC page {}", index + 1);
            }
        }
        Command::SyncToc { reload, .. } => {
            let mut sync = NovelSync::open(ctx, store)?;
            let report = sync.sync_toc(*reload)?;
            if !args.quiet {
                eprintln!(
                    "{} chapters ({} new, {} removed)",
                    sync.work().chapters.len(),
                    report.added.len(),
                    report.removed.len()
                );
            }
        }
        Command::Show { .. } => {
            let sync = NovelSync::open(ctx, store)?;
            show(&sync)?;
        }
        Command::RequestAll { reload, .. } => {
            let mut sync = NovelSync::open(ctx, store)?;
            let bar = progress_bar(args.quiet, "Downloading chapters");
            attach_progress(&mut sync, &bar);
            let result = sync.request_all(*reload);
            finish_progress(bar);
            print_batch(args.quiet, "Download", &result?);
        }
        Command::ScrapChapter {
            url,
            index,
            reload,
            output,
            ..
        } => {
            let chapter = ChapterRef::from_args(url.clone(), *index)?;
            let mut sync = NovelSync::open(ctx, store)?;
            let scraped = sync.scrap_chapter(&chapter, *reload)?;
            match output {
                Some(path) => std::fs::write(path, &scraped.content).map_err(|e| {
                    CliRunError::Output(format!("Cannot write {}: {}", path.display(), e))
                })?,
                None => println!("{}", scraped.content),
            }
        }
        Command::ScrapAll {
            redecode,
            refetch,
            on_content_failure,
            ..
        } => {
            if let Some(policy) = on_content_failure {
                ctx.options.on_content_failure = *policy;
            }
            let mut sync = NovelSync::open(ctx, store)?;
            let bar = progress_bar(args.quiet, "Decoding chapters");
            attach_progress(&mut sync, &bar);
            let result = sync.scrap_all(*redecode, *refetch);
            finish_progress(bar);
            print_batch(args.quiet, "Decode", &result?);
        }
        Command::SaveEpub {
            chapters_per_volume,
            start,
            epub_2,
            ncx,
            no_toc_page,
            output_dir,
            ..
        } => {
            if let Some(dir) = output_dir {
                validate_output_dir(dir)?;
            }
            let options = EpubOptions {
                version: if *epub_2 {
                    EpubVersion::Epub2
                } else {
                    EpubVersion::Epub3
                },
                include_ncx: *ncx,
                include_toc_page: !*no_toc_page && config.toc_page.unwrap_or(true),
            };
            let per_volume = chapters_per_volume
                .or(config.chapters_per_volume)
                .unwrap_or(DEFAULT_CHAPTERS_PER_VOLUME)
                .max(1);
            let mut sync = NovelSync::open(ctx, store)?;
            let bar = progress_bar(args.quiet, "Building volumes");
            attach_progress(&mut sync, &bar);
            let result = match start {
                Some(start) => {
                    let series_index = start.saturating_sub(1) / per_volume + 1;
                    sync.save_volume(*start, per_volume, series_index, &options)
                        .map(|v| v.into_iter().collect::<Vec<_>>())
                }
                None => sync.save_all_volumes(per_volume, &options),
            };
            finish_progress(bar);
            let volumes = result?;
            if volumes.is_empty() {
                return Err(CliRunError::Output(format!(
                    "No volume written for '{}': no chapter could be built.",
                    title
                )));
            }
            for volume in &volumes {
                report_volume(&sync, volume, output_dir.as_deref(), args.quiet)?;
            }
        }
        Command::SetMetadata {
            author,
            start_year,
            end_year,
            language,
            description,
            ..
        } => {
            let mut sync = NovelSync::open(ctx, store)?;
            sync.set_metadata(MetadataUpdate {
                author: author.clone(),
                start_year: *start_year,
                end_year: *end_year,
                language: language.clone(),
                description: description.clone(),
            })?;
        }
        Command::AddTag { tag, .. } => {
            let mut sync = NovelSync::open(ctx, store)?;
            if !sync.add_tag(tag)? && !args.quiet {
                eprintln!("Tag '{}' already present", tag);
            }
        }
        Command::RemoveTag { tag, .. } => {
            let mut sync = NovelSync::open(ctx, store)?;
            if !sync.remove_tag(tag)? && !args.quiet {
                eprintln!("Tag '{}' not present", tag);
            }
        }
        Command::SetCover { file, .. } => {
            let bytes = read_input(file)?;
            let mut sync = NovelSync::open(ctx, store)?;
            sync.set_cover_image(&bytes)?;
        }
        Command::SetHost { host, .. } => {
            let mut sync = NovelSync::open(ctx, store)?;
            sync.set_host(host)?;
        }
        Command::CleanFiles { hard, .. } => {
            let mut sync = NovelSync::open(ctx, store)?;
            let cleaned = sync.clean_files(*hard)?;
            if !args.quiet {
                eprintln!("Cleaned {} files", cleaned);
            }
        }
        Command::Hosts => {}
    }
    Ok(())
}

fn report_volume(
    sync: &NovelSync,
    volume: &VolumeReport,
    output_dir: Option<&Path>,
    quiet: bool,
) -> Result<(), CliRunError> {
    let path = match output_dir {
        Some(dir) => {
            let bytes = sync
                .store()
                .load(&volume.key)
                .map_err(SyncError::from)?
                .ok_or_else(|| CliRunError::Output(format!("Volume {} vanished", volume.key)))?;
            let path = dir.join(&volume.filename);
            std::fs::write(&path, bytes).map_err(|e| {
                CliRunError::Output(format!("Cannot write {}: {}", path.display(), e))
            })?;
            path
        }
        None => sync.store().path(&volume.key).map_err(SyncError::from)?,
    };
    if !quiet {
        eprintln!("Wrote {} ({} chapters)", path.display(), volume.chapters);
    }
    Ok(())
}

fn show(sync: &NovelSync) -> Result<(), CliRunError> {
    let work = sync.work();
    let meta = &work.metadata;
    println!("Title:       {}", meta.title);
    println!("Host:        {}", work.host);
    if let Some(author) = &meta.author {
        println!("Author:      {}", author);
    }
    match (meta.start_year, meta.end_year) {
        (Some(s), Some(e)) => println!("Years:       {}-{}", s, e),
        (Some(s), None) => println!("Years:       {}-", s),
        (None, Some(e)) => println!("Years:       -{}", e),
        (None, None) => {}
    }
    println!("Language:    {}", meta.language);
    if !meta.tags.is_empty() {
        println!("Tags:        {}", meta.tags.join(", "));
    }
    if let Some(description) = &meta.description {
        println!("Description: {}", description);
    }
    match &work.toc_main_url {
        Some(url) => println!("TOC:         {}", url),
        None => println!("TOC:         {} saved page(s)", sync.toc_page_count()?),
    }
    println!("Chapters:    {}", work.chapters.len());
    for (i, chapter) in work.chapters.iter().enumerate() {
        let fetched = match chapter.cache_key() {
            Some(key) => sync.store().exists(&key).map_err(SyncError::from)?,
            None => false,
        };
        println!(
            "{:>5} [{}{}] {}{}",
            i + 1,
            if fetched { 'F' } else { '-' },
            if chapter.title.is_some() { 'D' } else { '-' },
            chapter.url,
            chapter
                .title
                .as_deref()
                .map(|t| format!("  {}", t))
                .unwrap_or_default()
        );
    }
    Ok(())
}
