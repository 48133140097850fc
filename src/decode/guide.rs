//! Decode guide: the per-host rule table. Loaded once, validated up front, then only read.

use super::error::DecodeError;
use super::{normalize_host, Field};
use crate::fetch::RequestOverride;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Token that separates alternative selectors inside one `selector` string.
pub const XOR_SEPARATOR: &str = "XOR";

const BUNDLED_GUIDE: &str = include_str!("../../decode_guide/decode_guide.json");

/// Whether the chapter title is written into the chapter content as a heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TitleInContent {
    /// Always prefix the content with the title.
    Yes,
    /// Never prefix.
    No,
    /// Prefix only when the title does not already appear in the content.
    #[default]
    Search,
}

/// What to take from each matched element.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Extract {
    /// The element's direct string content.
    Text,
    /// The value of attribute `key`; elements without it are skipped.
    Attr { key: String },
}

/// Declarative selector rule for one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorRule {
    pub selector: Option<String>,
    pub element: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<String>>,
    /// Without `extract` the element's markup is returned.
    pub extract: Option<Extract>,
    #[serde(default)]
    pub array: bool,
    /// Only meaningful on the `index` rule: chapter links are listed newest first.
    #[serde(default)]
    pub inverted: bool,
}

impl SelectorRule {
    /// Candidate selectors in the order they are tried.
    ///
    /// An explicit `selector` is split on [XOR_SEPARATOR]; otherwise a single selector is
    /// composed from `element`, `id`, `class` and `attributes`.
    pub fn candidates(&self) -> Vec<String> {
        if let Some(selector) = &self.selector {
            return selector
                .split(XOR_SEPARATOR)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        let mut composed = String::new();
        if let Some(element) = &self.element {
            composed.push_str(element.trim());
        }
        if let Some(id) = &self.id {
            composed.push('#');
            composed.push_str(id.trim());
        }
        if let Some(class) = &self.class {
            for c in class.split_whitespace() {
                composed.push('.');
                composed.push_str(c);
            }
        }
        for (attr, value) in &self.attributes {
            match value {
                Some(v) => composed.push_str(&format!("[{}=\"{}\"]", attr, v.replace('"', "\\\""))),
                None => composed.push_str(&format!("[{}]", attr)),
            }
        }
        vec![composed]
    }

    fn has_target(&self) -> bool {
        self.selector.as_deref().is_some_and(|s| !s.trim().is_empty())
            || self.element.is_some()
            || self.id.is_some()
            || self.class.is_some()
    }
}

/// Extraction rule for one field: host-specific procedural logic, or a selector rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub enum FieldRule {
    Custom,
    Select(SelectorRule),
}

impl TryFrom<Map<String, Value>> for FieldRule {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        if map.get("use_custom_processor") == Some(&Value::Bool(true)) {
            if map.len() > 1 {
                let others: Vec<&str> = map
                    .keys()
                    .map(String::as_str)
                    .filter(|k| *k != "use_custom_processor")
                    .collect();
                return Err(format!(
                    "'use_custom_processor' excludes other keys, found {:?}",
                    others
                ));
            }
            return Ok(FieldRule::Custom);
        }
        let mut map = map;
        map.remove("use_custom_processor");
        let rule: SelectorRule =
            serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())?;
        if !rule.has_target() {
            return Err("rule needs 'selector' or one of 'element', 'id', 'class'".to_string());
        }
        if let Some(Extract::Attr { key }) = &rule.extract {
            if key.trim().is_empty() {
                return Err("'extract.key' must not be empty for attr extraction".to_string());
            }
        }
        Ok(FieldRule::Select(rule))
    }
}

/// All decode rules and flags for one host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostRule {
    pub host: String,
    pub title: Option<FieldRule>,
    pub content: Option<FieldRule>,
    pub index: Option<FieldRule>,
    pub next_page: Option<FieldRule>,
    #[serde(default)]
    pub has_pagination: bool,
    #[serde(default)]
    pub add_host_to_chapter: bool,
    #[serde(default)]
    pub toc_main_url_processor: bool,
    #[serde(default)]
    pub title_in_content: TitleInContent,
    #[serde(default, rename = "request_config")]
    pub request_override: Option<RequestOverride>,
    /// Extra tag names removed by markup cleaning.
    #[serde(default)]
    pub clean: Vec<String>,
}

impl HostRule {
    pub fn field(&self, field: Field) -> Option<&FieldRule> {
        match field {
            Field::Title => self.title.as_ref(),
            Field::Content => self.content.as_ref(),
            Field::Index => self.index.as_ref(),
            Field::NextPage => self.next_page.as_ref(),
            Field::TocMainUrl => None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("entry with empty 'host'".to_string());
        }
        if self.has_pagination && self.next_page.is_none() {
            return Err(format!(
                "host '{}' sets has_pagination but has no 'next_page' rule",
                self.host
            ));
        }
        if let Some(o) = &self.request_override {
            if o.request_retries == Some(0) {
                return Err(format!(
                    "host '{}': request_retries must be at least 1",
                    self.host
                ));
            }
        }
        Ok(())
    }
}

/// Immutable host → rule table.
#[derive(Debug, Clone, Default)]
pub struct DecodeGuide {
    rules: HashMap<String, HostRule>,
}

impl DecodeGuide {
    /// Guide shipped inside the binary.
    pub fn bundled() -> Result<Self, DecodeError> {
        Self::from_json(BUNDLED_GUIDE)
    }

    /// Load a guide file. Missing file, unreadable file and malformed JSON are all errors.
    pub fn from_file(path: &Path) -> Result<Self, DecodeError> {
        let s = std::fs::read_to_string(path).map_err(|e| DecodeError::GuideIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&s).map_err(|e| match e {
            DecodeError::InvalidGuide { reason } => DecodeError::InvalidGuide {
                reason: format!("{}: {}", path.display(), reason),
            },
            other => other,
        })
    }

    pub fn from_json(s: &str) -> Result<Self, DecodeError> {
        let rules: Vec<HostRule> =
            serde_json::from_str(s).map_err(|e| DecodeError::InvalidGuide {
                reason: e.to_string(),
            })?;
        Self::from_rules(rules)
    }

    pub fn from_rules(rules: Vec<HostRule>) -> Result<Self, DecodeError> {
        let mut table = HashMap::with_capacity(rules.len());
        for mut rule in rules {
            rule.validate()
                .map_err(|reason| DecodeError::InvalidGuide { reason })?;
            let host = normalize_host(&rule.host);
            rule.host = host.clone();
            if table.insert(host.clone(), rule).is_some() {
                return Err(DecodeError::InvalidGuide {
                    reason: format!("host '{}' appears more than once", host),
                });
            }
        }
        Ok(Self { rules: table })
    }

    /// Rule for `host` (normalized first). Unknown hosts are an error, never a default.
    pub fn rule(&self, host: &str) -> Result<&HostRule, DecodeError> {
        let host = normalize_host(host);
        self.rules
            .get(&host)
            .ok_or(DecodeError::HostNotFound { host })
    }

    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        hosts.sort_unstable();
        hosts
    }
}
