//! Decode guide engine. Turns per-host declarative rules into markup queries.
//!
//! A [Decoder] is bound to one host's [HostRule] and a shared [ProcessorRegistry]. Custom
//! processors win over declarative rules; otherwise each candidate selector of the rule is
//! tried in order and the first one that matches anything is used.

mod error;
mod guide;
pub mod markup;
mod processor;

pub use error::DecodeError;
pub use guide::{
    DecodeGuide, Extract, FieldRule, HostRule, SelectorRule, TitleInContent, XOR_SEPARATOR,
};
pub use processor::{CustomProcessor, ProcessorRegistry};

use crate::fetch::RequestOverride;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::fmt;
use std::sync::Arc;

/// Named field a rule (or processor) can extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Content,
    Index,
    NextPage,
    /// Rewrites a work's TOC URL; only reachable through a custom processor.
    TocMainUrl,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Content => "content",
            Field::Index => "index",
            Field::NextPage => "next_page",
            Field::TocMainUrl => "toc_main_url",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Scalar(String),
    List(Vec<String>),
}

impl Decoded {
    pub fn into_list(self) -> Vec<String> {
        match self {
            Decoded::Scalar(s) => vec![s],
            Decoded::List(v) => v,
        }
    }

    pub fn first(self) -> Option<String> {
        match self {
            Decoded::Scalar(s) => Some(s),
            Decoded::List(v) => v.into_iter().next(),
        }
    }

    pub fn join(self, sep: &str) -> String {
        match self {
            Decoded::Scalar(s) => s,
            Decoded::List(v) => v.join(sep),
        }
    }
}

/// Lowercase, strip scheme, path, port and a leading `www.`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}

/// Normalized host of `url`, or None if it does not parse as an absolute URL with a host.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    parsed.host_str().map(normalize_host)
}

impl TitleInContent {
    /// Compose the chapter body from its title and decoded content.
    pub fn apply(self, title: &str, content: &str) -> String {
        let escaped = markup::escape_html(title);
        let heading = format!("<h4>{}</h4>\n", escaped);
        match self {
            TitleInContent::Yes => heading + content,
            TitleInContent::No => content.to_string(),
            TitleInContent::Search => {
                if content.contains(title) || content.contains(&escaped) {
                    content.to_string()
                } else {
                    heading + content
                }
            }
        }
    }
}

/// Field extraction for one host.
#[derive(Debug, Clone)]
pub struct Decoder {
    rule: HostRule,
    processors: Arc<ProcessorRegistry>,
}

impl Decoder {
    /// Bind the rule for `host`. Fails with HostNotFound for hosts missing from the guide.
    pub fn new(
        guide: &DecodeGuide,
        host: &str,
        processors: Arc<ProcessorRegistry>,
    ) -> Result<Self, DecodeError> {
        let rule = guide.rule(host)?.clone();
        Ok(Self { rule, processors })
    }

    pub fn host(&self) -> &str {
        &self.rule.host
    }

    pub fn rule(&self) -> &HostRule {
        &self.rule
    }

    /// Extract `field` from `markup`.
    ///
    /// Ok(None) means the rule matched nothing; a missing rule is RuleMissing. Titles are
    /// always scalar: list results are joined with a single space.
    pub fn decode(&self, markup: &str, field: Field) -> Result<Option<Decoded>, DecodeError> {
        let host = self.host();
        if let Some(processor) = self.processors.get(host, field) {
            tracing::debug!(host, %field, "decoding with custom processor");
            return processor.process(markup);
        }
        let rule = match self.rule.field(field) {
            Some(FieldRule::Select(rule)) => rule,
            Some(FieldRule::Custom) => {
                return Err(DecodeError::ProcessorMissing {
                    host: host.to_string(),
                    field,
                })
            }
            None => {
                return Err(DecodeError::RuleMissing {
                    host: host.to_string(),
                    field,
                })
            }
        };
        if markup.trim().is_empty() {
            return Err(DecodeError::ParseFailure {
                host: host.to_string(),
                field,
                reason: "empty markup".to_string(),
            });
        }

        let doc = Html::parse_document(markup);
        let values = self.select_values(&doc, rule, field)?;
        tracing::debug!(host, %field, matches = values.len(), "decoded");
        if values.is_empty() {
            return Ok(None);
        }
        let decoded = if rule.array {
            Decoded::List(values)
        } else {
            match values.into_iter().next() {
                Some(v) => Decoded::Scalar(v),
                None => return Ok(None),
            }
        };
        Ok(Some(match (field, decoded) {
            (Field::Title, Decoded::List(parts)) => Decoded::Scalar(parts.join(" ")),
            (_, decoded) => decoded,
        }))
    }

    fn select_values(
        &self,
        doc: &Html,
        rule: &SelectorRule,
        field: Field,
    ) -> Result<Vec<String>, DecodeError> {
        for candidate in rule.candidates() {
            let selector =
                Selector::parse(&candidate).map_err(|e| DecodeError::InvalidSelector {
                    host: self.host().to_string(),
                    field,
                    selector: candidate.clone(),
                    reason: e.to_string(),
                })?;
            let matched: Vec<ElementRef<'_>> = doc.select(&selector).collect();
            if matched.is_empty() {
                continue;
            }
            tracing::trace!(host = self.host(), %field, selector = %candidate, "selector matched");
            return Ok(matched
                .into_iter()
                .filter_map(|el| extract(el, rule.extract.as_ref()))
                .collect());
        }
        Ok(Vec::new())
    }

    /// Chapter links found on one TOC page, in document order.
    pub fn chapter_urls(&self, markup: &str) -> Result<Vec<String>, DecodeError> {
        Ok(self
            .decode(markup, Field::Index)?
            .map(Decoded::into_list)
            .unwrap_or_default())
    }

    pub fn next_page_url(&self, markup: &str) -> Result<Option<String>, DecodeError> {
        Ok(self
            .decode(markup, Field::NextPage)?
            .and_then(Decoded::first)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    pub fn chapter_title(&self, markup: &str) -> Result<Option<String>, DecodeError> {
        Ok(self
            .decode(markup, Field::Title)?
            .map(|d| d.join(" ").trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    /// Chapter body; list results (one entry per paragraph) are joined with newlines.
    ///
    /// Text extracted by a declarative `text` rule is escaped so the body stays valid XHTML.
    pub fn chapter_content(&self, markup: &str) -> Result<Option<String>, DecodeError> {
        let plain_text = self.processors.get(self.host(), Field::Content).is_none()
            && matches!(
                self.rule.field(Field::Content),
                Some(FieldRule::Select(SelectorRule {
                    extract: Some(Extract::Text),
                    ..
                }))
            );
        Ok(self
            .decode(markup, Field::Content)?
            .map(|d| {
                if plain_text {
                    d.into_list()
                        .iter()
                        .map(|piece| markup::escape_html(piece))
                        .collect::<Vec<_>>()
                        .join("\n")
                } else {
                    d.join("\n")
                }
            })
            .filter(|s| !s.trim().is_empty()))
    }

    /// TOC URL to fetch for `url`, rewritten by the host's processor when the rule asks for it.
    pub fn toc_main_url(&self, url: &str) -> Result<String, DecodeError> {
        if !self.rule.toc_main_url_processor {
            return Ok(url.to_string());
        }
        match self.processors.get(self.host(), Field::TocMainUrl) {
            Some(processor) => Ok(processor
                .process(url)?
                .and_then(Decoded::first)
                .unwrap_or_else(|| url.to_string())),
            None => {
                tracing::warn!(
                    host = self.host(),
                    url,
                    "toc_main_url_processor is set but no processor is registered; using URL as-is"
                );
                Ok(url.to_string())
            }
        }
    }

    pub fn clean_markup(&self, markup: &str, hard: bool) -> String {
        markup::clean(markup, &self.rule.clean, hard)
    }

    pub fn title_in_content(&self) -> TitleInContent {
        self.rule.title_in_content
    }

    pub fn has_pagination(&self) -> bool {
        self.rule.has_pagination
    }

    pub fn add_host_to_chapter(&self) -> bool {
        self.rule.add_host_to_chapter
    }

    /// Whether the index rule lists chapters newest first.
    pub fn is_index_inverted(&self) -> bool {
        matches!(&self.rule.index, Some(FieldRule::Select(rule)) if rule.inverted)
    }

    pub fn request_override(&self) -> Option<&RequestOverride> {
        self.rule.request_override.as_ref()
    }
}

fn extract(element: ElementRef<'_>, action: Option<&Extract>) -> Option<String> {
    match action {
        Some(Extract::Text) => markup::direct_string(element),
        Some(Extract::Attr { key }) => element
            .value()
            .attr(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from),
        None => Some(markup::serialize_element(element)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(guide_json: &str) -> Result<Decoder, DecodeError> {
        let guide = DecodeGuide::from_json(guide_json)?;
        Decoder::new(&guide, "test.com", Arc::new(ProcessorRegistry::new()))
    }

    const PARAGRAPHS: &str = r#"<html><body><div class="c"><p>one</p><p>two</p><p>three</p></div></body></html>"#;

    #[test]
    fn normalize_host_strips_scheme_port_and_www() {
        assert_eq!(normalize_host("https://WWW.Example.com:8080/path"), "example.com");
        assert_eq!(normalize_host("www.example.com"), "example.com");
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(host_of("http://www.test.com/novel/1").as_deref(), Some("test.com"));
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn scalar_rule_returns_first_match_only() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "content": {"selector": "div.c p", "extract": {"type": "text"}}}]"#,
        )?;
        assert_eq!(
            d.decode(PARAGRAPHS, Field::Content)?,
            Some(Decoded::Scalar("one".to_string()))
        );
        Ok(())
    }

    #[test]
    fn array_rule_returns_all_matches_in_order() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "content": {"selector": "div.c p", "extract": {"type": "text"}, "array": true}}]"#,
        )?;
        assert_eq!(
            d.decode(PARAGRAPHS, Field::Content)?,
            Some(Decoded::List(vec!["one".into(), "two".into(), "three".into()]))
        );
        Ok(())
    }

    #[test]
    fn xor_chain_uses_first_matching_candidate() -> Result<(), DecodeError> {
        let chained = decoder(
            r#"[{"host": "test.com", "content": {"selector": "div.missing p XOR div.c p", "array": true}}]"#,
        )?;
        let single = decoder(
            r#"[{"host": "test.com", "content": {"selector": "div.c p", "array": true}}]"#,
        )?;
        assert_eq!(
            chained.decode(PARAGRAPHS, Field::Content)?,
            single.decode(PARAGRAPHS, Field::Content)?
        );
        Ok(())
    }

    #[test]
    fn xor_chain_commits_to_first_match_without_merging() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "content": {"selector": "div.c p:first-child XOR div.c p", "extract": {"type": "text"}, "array": true}}]"#,
        )?;
        assert_eq!(
            d.decode(PARAGRAPHS, Field::Content)?,
            Some(Decoded::List(vec!["one".into()]))
        );
        Ok(())
    }

    #[test]
    fn attr_extract_skips_elements_without_attribute() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "index": {"selector": "a", "extract": {"type": "attr", "key": "href"}, "array": true}}]"#,
        )?;
        let html = r#"<a href="/c1">1</a><a name="anchor">x</a><a href="">e</a><a href="/c2">2</a>"#;
        assert_eq!(d.chapter_urls(html)?, vec!["/c1", "/c2"]);
        Ok(())
    }

    #[test]
    fn toc_links_in_document_order() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "index": {"selector": "ul li a", "extract": {"type": "attr", "key": "href"}, "array": true}}]"#,
        )?;
        let html = r#"<ul><li><a href="/c1">1</a></li><li><a href="/c2">2</a></li></ul>"#;
        assert_eq!(d.chapter_urls(html)?, vec!["/c1", "/c2"]);
        Ok(())
    }

    #[test]
    fn no_match_is_absent_not_error() -> Result<(), DecodeError> {
        let d = decoder(r#"[{"host": "test.com", "next_page": {"selector": "a.next"}}]"#)?;
        assert_eq!(d.decode(PARAGRAPHS, Field::NextPage)?, None);
        assert_eq!(d.next_page_url(PARAGRAPHS)?, None);
        Ok(())
    }

    #[test]
    fn title_list_is_joined_with_space() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "title": {"selector": "h1 span", "extract": {"type": "text"}, "array": true}}]"#,
        )?;
        let html = "<h1><span>Chapter 3</span><span>The Fall</span></h1>";
        assert_eq!(
            d.decode(html, Field::Title)?,
            Some(Decoded::Scalar("Chapter 3 The Fall".to_string()))
        );
        Ok(())
    }

    #[test]
    fn missing_rule_is_rule_missing() -> Result<(), String> {
        let d = decoder(r#"[{"host": "test.com"}]"#).map_err(|e| e.to_string())?;
        match d.decode(PARAGRAPHS, Field::Title) {
            Err(DecodeError::RuleMissing { field: Field::Title, .. }) => Ok(()),
            other => Err(format!("expected RuleMissing, got {:?}", other)),
        }
    }

    #[test]
    fn blank_markup_is_parse_failure() -> Result<(), String> {
        let d = decoder(r#"[{"host": "test.com", "title": {"selector": "h1"}}]"#)
            .map_err(|e| e.to_string())?;
        match d.decode("  \n", Field::Title) {
            Err(DecodeError::ParseFailure { .. }) => Ok(()),
            other => Err(format!("expected ParseFailure, got {:?}", other)),
        }
    }

    #[test]
    fn invalid_selector_is_reported() -> Result<(), String> {
        let d = decoder(r#"[{"host": "test.com", "title": {"selector": "h1[[["}}]"#)
            .map_err(|e| e.to_string())?;
        match d.decode(PARAGRAPHS, Field::Title) {
            Err(DecodeError::InvalidSelector { selector, .. }) if selector == "h1[[[" => Ok(()),
            other => Err(format!("expected InvalidSelector, got {:?}", other)),
        }
    }

    #[test]
    fn custom_rule_without_processor_fails() -> Result<(), String> {
        let d = decoder(r#"[{"host": "test.com", "index": {"use_custom_processor": true}}]"#)
            .map_err(|e| e.to_string())?;
        match d.decode(PARAGRAPHS, Field::Index) {
            Err(DecodeError::ProcessorMissing { field: Field::Index, .. }) => Ok(()),
            other => Err(format!("expected ProcessorMissing, got {:?}", other)),
        }
    }

    #[test]
    fn processor_bypasses_selector_rule() -> Result<(), DecodeError> {
        let guide = DecodeGuide::from_json(
            r#"[{"host": "test.com", "title": {"selector": "h1", "extract": {"type": "text"}}}]"#,
        )?;
        let mut registry = ProcessorRegistry::new();
        registry.register("test.com", Field::Title, |input: &str| -> Result<_, DecodeError> {
            Ok(Some(Decoded::List(vec![input.len().to_string(), "raw".into()])))
        });
        let d = Decoder::new(&guide, "www.test.com", Arc::new(registry))?;
        assert_eq!(
            d.decode("<h1>ignored</h1>", Field::Title)?,
            Some(Decoded::List(vec!["16".into(), "raw".into()]))
        );
        Ok(())
    }

    #[test]
    fn content_without_extract_is_markup() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "content": {"element": "div", "class": "c", "array": true}}]"#,
        )?;
        assert_eq!(
            d.chapter_content(PARAGRAPHS)?.as_deref(),
            Some(r#"<div class="c"><p>one</p><p>two</p><p>three</p></div>"#)
        );
        Ok(())
    }

    #[test]
    fn text_content_is_escaped_for_xhtml() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "content": {"selector": "div.c p", "extract": {"type": "text"}, "array": true}}]"#,
        )?;
        let html = r#"<div class="c"><p>a &lt; b &amp; c</p><p>"quoted"</p></div>"#;
        assert_eq!(
            d.chapter_content(html)?.as_deref(),
            Some("a &lt; b &amp; c\n&quot;quoted&quot;")
        );
        Ok(())
    }

    #[test]
    fn mixed_markup_title_is_absent() -> Result<(), DecodeError> {
        let d = decoder(
            r#"[{"host": "test.com", "title": {"selector": "h1", "extract": {"type": "text"}}}]"#,
        )?;
        assert_eq!(d.chapter_title("<h1>Chapter 12: <em>The</em> Return</h1>")?, None);
        assert_eq!(
            d.chapter_title("<h1> <span>Chapter 12: The Return</span> </h1>")?.as_deref(),
            Some("Chapter 12: The Return")
        );
        Ok(())
    }

    #[test]
    fn toc_main_url_uses_registered_processor() -> Result<(), DecodeError> {
        let guide = DecodeGuide::from_json(
            r#"[{"host": "mtlnovels.com", "toc_main_url_processor": true}, {"host": "test.com", "toc_main_url_processor": true}]"#,
        )?;
        let registry = Arc::new(ProcessorRegistry::with_builtin());
        let mtl = Decoder::new(&guide, "mtlnovels.com", registry.clone())?;
        assert_eq!(
            mtl.toc_main_url("https://www.mtlnovels.com/my-novel")?,
            "https://www.mtlnovels.com/my-novel/chapter-list/"
        );
        let other = Decoder::new(&guide, "test.com", registry)?;
        assert_eq!(other.toc_main_url("https://test.com/n")?, "https://test.com/n");
        Ok(())
    }

    #[test]
    fn search_policy_skips_duplicate_heading() {
        let content = "<p>Chapter 1: Start</p><p>Body</p>";
        assert_eq!(TitleInContent::Search.apply("Chapter 1: Start", content), content);
        assert_eq!(
            TitleInContent::Search.apply("Prologue", content),
            format!("<h4>Prologue</h4>\n{}", content)
        );
    }

    #[test]
    fn yes_and_no_policies() {
        let content = "<p>Prologue</p>";
        assert_eq!(
            TitleInContent::Yes.apply("Prologue", content),
            "<h4>Prologue</h4>\n<p>Prologue</p>"
        );
        assert_eq!(TitleInContent::No.apply("Other", content), content);
    }

    #[test]
    fn search_policy_matches_escaped_title() {
        let content = "<p>Tom &amp; Jerry</p>";
        assert_eq!(TitleInContent::Search.apply("Tom & Jerry", content), content);
    }
}
