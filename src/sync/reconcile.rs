//! Link extraction and chapter-list reconciliation. Pure functions over the model.

use crate::model::Chapter;
use std::collections::{HashMap, HashSet};

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// URLs that got a new bare chapter.
    pub added: Vec<String>,
    /// Chapters dropped because their URL left the link list, in their previous order.
    pub removed: Vec<Chapter>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Make `chapters` match `links`: drop chapters whose URL is gone, add bare chapters for new
/// URLs and reorder to the link order. Surviving chapters are moved, never rebuilt, so their
/// cached filename and title stay as they were.
pub fn reconcile(chapters: &mut Vec<Chapter>, links: &[String]) -> ReconcileReport {
    let wanted: HashSet<&str> = links.iter().map(String::as_str).collect();
    let mut existing: HashMap<String, Chapter> = HashMap::with_capacity(chapters.len());
    let mut removed = Vec::new();
    for chapter in chapters.drain(..) {
        if !wanted.contains(chapter.url.as_str()) || existing.contains_key(&chapter.url) {
            removed.push(chapter);
        } else {
            existing.insert(chapter.url.clone(), chapter);
        }
    }

    let mut added = Vec::new();
    let mut placed = HashSet::with_capacity(links.len());
    for url in links {
        if !placed.insert(url.as_str()) {
            continue;
        }
        match existing.remove(url) {
            Some(chapter) => chapters.push(chapter),
            None => {
                added.push(url.clone());
                chapters.push(Chapter::new(url.clone()));
            }
        }
    }
    ReconcileReport { added, removed }
}

/// Flatten per-page link lists into the authoritative chapter link list.
///
/// Pages are concatenated in order, the whole list is reversed when `inverted`, relative
/// links get `https://{host}` in front when `host_prefix` is set, and duplicates are dropped
/// keeping the first occurrence (after reversal).
pub fn extract_links(pages: Vec<Vec<String>>, inverted: bool, host_prefix: Option<&str>) -> Vec<String> {
    let mut links: Vec<String> = pages.into_iter().flatten().collect();
    if inverted {
        links.reverse();
    }
    let mut seen = HashSet::with_capacity(links.len());
    links
        .into_iter()
        .map(|link| link.trim().to_string())
        .filter(|link| !link.is_empty())
        .map(|link| match host_prefix {
            Some(host) => prefix_host(host, link),
            None => link,
        })
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

fn prefix_host(host: &str, link: String) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link;
    }
    if link.starts_with('/') {
        format!("https://{}{}", host, link)
    } else {
        format!("https://{}/{}", host, link)
    }
}
