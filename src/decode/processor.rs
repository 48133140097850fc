//! Host-specific procedural extractors, keyed by (host, field).

use super::error::DecodeError;
use super::{normalize_host, Decoded, Field};
use std::collections::HashMap;
use std::fmt;

/// Procedural extractor for one field of one host. Receives the input verbatim and its
/// result is returned to the caller as-is.
pub trait CustomProcessor: Send + Sync {
    fn process(&self, input: &str) -> Result<Option<Decoded>, DecodeError>;
}

impl<F> CustomProcessor for F
where
    F: Fn(&str) -> Result<Option<Decoded>, DecodeError> + Send + Sync,
{
    fn process(&self, input: &str) -> Result<Option<Decoded>, DecodeError> {
        self(input)
    }
}

/// Registry of custom processors. Built once, then shared read-only.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<(String, Field), Box<dyn CustomProcessor>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .processors
            .keys()
            .map(|(host, field)| format!("{}:{}", host, field))
            .collect();
        keys.sort();
        f.debug_struct("ProcessorRegistry")
            .field("processors", &keys)
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the processors shipped with the crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("mtlnovels.com", Field::TocMainUrl, mtlnovels_toc_main_url);
        registry
    }

    /// Register `processor` for `field` on `host`, replacing any previous one.
    pub fn register(
        &mut self,
        host: &str,
        field: Field,
        processor: impl CustomProcessor + 'static,
    ) {
        self.processors
            .insert((normalize_host(host), field), Box::new(processor));
    }

    pub fn get(&self, host: &str, field: Field) -> Option<&dyn CustomProcessor> {
        self.processors
            .get(&(normalize_host(host), field))
            .map(|p| p.as_ref())
    }

    pub fn has(&self, host: &str, field: Field) -> bool {
        self.get(host, field).is_some()
    }
}

const MTLNOVELS_BASE: &str = "https://www.mtlnovels.com/";

/// `https://www.mtlnovels.com/{id}` → `https://www.mtlnovels.com/{id}/chapter-list/`.
fn mtlnovels_toc_main_url(url: &str) -> Result<Option<Decoded>, DecodeError> {
    let id = url
        .trim()
        .strip_prefix(MTLNOVELS_BASE)
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .ok_or_else(|| DecodeError::ParseFailure {
            host: "mtlnovels.com".to_string(),
            field: Field::TocMainUrl,
            reason: format!("expected {}<novel-id>, got {:?}", MTLNOVELS_BASE, url),
        })?;
    Ok(Some(Decoded::Scalar(format!(
        "{}{}/chapter-list/",
        MTLNOVELS_BASE, id
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtlnovels_rewrites_novel_url() -> Result<(), DecodeError> {
        let out = mtlnovels_toc_main_url("https://www.mtlnovels.com/some-novel/")?;
        assert_eq!(
            out,
            Some(Decoded::Scalar(
                "https://www.mtlnovels.com/some-novel/chapter-list/".to_string()
            ))
        );
        Ok(())
    }

    #[test]
    fn mtlnovels_rejects_other_urls() {
        assert!(mtlnovels_toc_main_url("https://example.com/some-novel").is_err());
        assert!(mtlnovels_toc_main_url("https://www.mtlnovels.com/").is_err());
        assert!(mtlnovels_toc_main_url("https://www.mtlnovels.com/a/b/c").is_err());
    }

    #[test]
    fn registry_lookup_normalizes_host() {
        let registry = ProcessorRegistry::with_builtin();
        assert!(registry.has("www.mtlnovels.com", Field::TocMainUrl));
        assert!(!registry.has("mtlnovels.com", Field::Title));
    }

    #[test]
    fn closures_register_as_processors() -> Result<(), String> {
        let mut registry = ProcessorRegistry::new();
        registry.register("a.com", Field::Index, |input: &str| -> Result<_, DecodeError> {
            Ok(Some(Decoded::List(
                input.split(',').map(String::from).collect(),
            )))
        });
        let processor = registry
            .get("a.com", Field::Index)
            .ok_or("processor not registered")?;
        let out = processor.process("x,y").map_err(|e| e.to_string())?;
        assert_eq!(out, Some(Decoded::List(vec!["x".into(), "y".into()])));
        Ok(())
    }
}
