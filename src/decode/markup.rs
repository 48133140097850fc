//! DOM helpers on top of `scraper`: direct-string text, XHTML-style serialization, tag cleaning.

use scraper::{ElementRef, Html, Node};
use std::collections::HashSet;

/// Tags always removed by [clean].
pub const SOFT_CLEAN_TAGS: &[&str] = &[
    "script", "style", "link", "form", "meta", "hr", "noscript", "button",
];

/// Tags additionally removed by a hard clean.
pub const HARD_CLEAN_TAGS: &[&str] = &[
    "header", "footer", "nav", "aside", "iframe", "object", "embed", "svg", "canvas", "map",
    "area", "audio", "video", "track", "source", "applet", "frame", "frameset", "noframes",
    "noembed", "blink", "marquee",
];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// The element's own string, trimmed.
///
/// Defined only when the element has a single non-blank child: a text node yields its text,
/// an element yields that child's string, recursively. Mixed content returns None.
pub fn direct_string(element: ElementRef<'_>) -> Option<String> {
    let mut children = element.children().filter(|child| match child.value() {
        Node::Text(text) => !text.trim().is_empty(),
        Node::Element(_) => true,
        _ => false,
    });
    let only = match (children.next(), children.next()) {
        (Some(only), None) => only,
        _ => return None,
    };
    match only.value() {
        Node::Text(text) => Some(text.trim().to_string()),
        _ => ElementRef::wrap(only).and_then(direct_string),
    }
}

/// Outer markup of `element`, void elements written as `<br />`.
pub fn serialize_element(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    write_element(element, &mut out);
    out
}

fn write_element(element: ElementRef<'_>, out: &mut String) {
    let el = element.value();
    let name = el.name();
    out.push('<');
    out.push_str(name);
    for (key, value) in el.attrs() {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    if VOID_ELEMENTS.contains(&name) {
        out.push_str(" />");
        return;
    }
    out.push('>');
    write_children(element, out);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn write_children(element: ElementRef<'_>, out: &mut String) {
    let raw = RAW_TEXT_ELEMENTS.contains(&element.value().name());
    for child in element.children() {
        match child.value() {
            Node::Text(text) if raw => out.push_str(text),
            Node::Text(text) => out.push_str(&escape_text(text)),
            Node::Comment(comment) => {
                out.push_str("<!--");
                out.push_str(comment);
                out.push_str("-->");
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    write_element(child, out);
                }
            }
            _ => {}
        }
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

/// Escape a plain string for use as element text.
pub fn escape_html(s: &str) -> String {
    escape_attr(s)
}

fn looks_like_document(markup: &str) -> bool {
    let head: String = markup
        .trim_start()
        .chars()
        .take(9)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

/// Remove the soft tag set, `extra` tags and (when `hard`) the hard tag set, then re-serialize.
///
/// Lines of the output are trimmed and blank lines dropped. Whole documents keep their
/// doctype and `<html>` root; anything else is treated as a fragment.
pub fn clean(markup: &str, extra: &[String], hard: bool) -> String {
    let mut tags: HashSet<String> = SOFT_CLEAN_TAGS.iter().map(|t| t.to_string()).collect();
    tags.extend(extra.iter().map(|t| t.trim().to_ascii_lowercase()));
    if hard {
        tags.extend(HARD_CLEAN_TAGS.iter().map(|t| t.to_string()));
    }

    let document = looks_like_document(markup);
    let mut html = if document {
        Html::parse_document(markup)
    } else {
        Html::parse_fragment(markup)
    };

    let doomed: Vec<_> = html
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|e| tags.contains(e.value().name()))
        .map(|e| e.id())
        .collect();
    for id in doomed {
        if let Some(mut node) = html.tree.get_mut(id) {
            node.detach();
        }
    }

    let mut out = String::new();
    if document {
        out.push_str("<!DOCTYPE html>\n");
        write_element(html.root_element(), &mut out);
    } else {
        write_children(html.root_element(), &mut out);
    }
    collapse_blank_lines(&out)
}

fn collapse_blank_lines(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Selector;

    fn first<'a>(doc: &'a Html, sel: &str) -> Option<ElementRef<'a>> {
        let sel = Selector::parse(sel).ok()?;
        doc.select(&sel).next()
    }

    #[test]
    fn direct_string_none_for_mixed_text_and_markup() {
        let doc = Html::parse_fragment(r#"<p>Hello <b>world</b></p><a><span> Inner </span></a>"#);
        assert_eq!(first(&doc, "p").and_then(direct_string), None);
        assert_eq!(first(&doc, "a").and_then(direct_string).as_deref(), Some("Inner"));
    }

    #[test]
    fn direct_string_none_for_mixed_children_without_text() {
        let doc = Html::parse_fragment(r#"<div> <span>a</span><span>b</span> </div>"#);
        assert_eq!(first(&doc, "div").and_then(direct_string), None);
    }

    #[test]
    fn serialize_writes_void_elements_xhtml_style() {
        let doc = Html::parse_fragment(r#"<p class="x">A &amp; B<br>C<img src="i.png" alt="a&quot;b"></p>"#);
        let p = first(&doc, "p").map(serialize_element);
        assert_eq!(
            p.as_deref(),
            Some(r#"<p class="x">A &amp; B<br />C<img src="i.png" alt="a&quot;b" /></p>"#)
        );
    }

    #[test]
    fn soft_clean_removes_scripts_and_blank_lines() {
        let html = "<div>\n  <script>var x = 1;</script>\n\n  <p>Text</p>\n   \n<nav>menu</nav>\n</div>";
        let cleaned = clean(html, &[], false);
        assert_eq!(cleaned, "<div>\n<p>Text</p>\n<nav>menu</nav>\n</div>");
    }

    #[test]
    fn hard_clean_removes_structural_tags() {
        let html = "<div><nav>menu</nav><p>Text</p><footer>f</footer></div>";
        assert_eq!(clean(html, &[], true), "<div><p>Text</p></div>");
    }

    #[test]
    fn extra_tags_are_removed() {
        let html = "<div><p>Keep</p><ins class=\"ad\">Ad</ins></div>";
        let cleaned = clean(html, &["INS".to_string()], false);
        assert_eq!(cleaned, "<div><p>Keep</p></div>");
    }

    #[test]
    fn clean_keeps_document_shell() {
        let html = "<!DOCTYPE html><html><head><title>T</title><style>p{}</style></head><body><p>Body</p></body></html>";
        let cleaned = clean(html, &[], false);
        assert!(cleaned.starts_with("<!DOCTYPE html>\n<html>"));
        assert!(cleaned.contains("<title>T</title>"));
        assert!(cleaned.contains("<p>Body</p>"));
        assert!(!cleaned.contains("<style>"));
    }
}
