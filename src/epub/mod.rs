//! EPUB writer for one compiled volume (a window of chapters).
//!
//! Writes EPUB 3 (OPF 3.0, nav.xhtml, optional NCX) or EPUB 2 (OPF 2.0, NCX) into any
//! `Write + Seek` sink. Chapter bodies must already be XHTML-safe markup.

use std::io::{Seek, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";
const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";

/// EPUB format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpubVersion {
    /// OPF 3.0, nav.xhtml, HTML5 chapters. Optional toc.ncx for older readers.
    #[default]
    Epub3,
    /// OPF 2.0, toc.ncx only, XHTML 1.1 chapters.
    Epub2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpubOptions {
    pub version: EpubVersion,
    /// Also write toc.ncx in EPUB 3. Always written for EPUB 2.
    pub include_ncx: bool,
    /// Insert a visible table-of-contents page after the cover.
    pub include_toc_page: bool,
}

impl Default for EpubOptions {
    fn default() -> Self {
        Self {
            version: EpubVersion::Epub3,
            include_ncx: false,
            include_toc_page: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: volume title is empty.")]
    EmptyTitle,

    #[error("Cannot write EPUB: volume has no chapters.")]
    NoChapters,

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// Collection this volume belongs to (written as calibre series metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub name: String,
    /// 1-based position in the series.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeChapter {
    pub title: String,
    pub body: String,
}

/// Everything that goes into one EPUB file.
#[derive(Debug, Clone, Default)]
pub struct Volume {
    pub identifier: String,
    pub title: String,
    pub author: Option<String>,
    pub language: String,
    pub description: Option<String>,
    pub subjects: Vec<String>,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub series: Option<Series>,
    /// Raw cover image bytes; format is sniffed (PNG, GIF, otherwise JPEG).
    pub cover: Option<Vec<u8>>,
    pub chapters: Vec<VolumeChapter>,
}

struct CoverImage<'a> {
    data: &'a [u8],
    ext: &'static str,
    media_type: &'static str,
}

fn sniff_cover(data: &[u8]) -> CoverImage<'_> {
    let (ext, media_type) = if data.starts_with(b"\x89PNG") {
        ("png", "image/png")
    } else if data.starts_with(b"GIF8") {
        ("gif", "image/gif")
    } else {
        ("jpg", "image/jpeg")
    };
    CoverImage {
        data,
        ext,
        media_type,
    }
}

/// Write `volume` as an EPUB archive into `out` and hand the sink back.
pub fn write_epub<W: Write + Seek>(
    volume: &Volume,
    out: W,
    options: &EpubOptions,
) -> Result<W, EpubError> {
    if volume.title.trim().is_empty() {
        return Err(EpubError::EmptyTitle);
    }
    if volume.chapters.is_empty() {
        return Err(EpubError::NoChapters);
    }

    let mut zip = ZipWriter::new(out);
    let stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    let deflate = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    // mimetype must be the first entry, uncompressed
    zip.start_file("mimetype", stored)?;
    zip.write_all(MIMETYPE)?;
    zip.start_file("META-INF/container.xml", deflate)?;
    zip.write_all(CONTAINER_XML)?;

    let cover = volume
        .cover
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(sniff_cover);
    let with_ncx = options.include_ncx || options.version == EpubVersion::Epub2;

    let mut put = |name: &str, content: String| -> Result<(), EpubError> {
        zip.start_file(format!("{}{}", OEBPS_PREFIX, name), deflate)?;
        zip.write_all(content.as_bytes())?;
        Ok(())
    };

    put("content.opf", opf(volume, cover.as_ref(), options, with_ncx))?;
    if options.version == EpubVersion::Epub3 {
        put("nav.xhtml", nav_xhtml(volume))?;
    }
    if with_ncx {
        put("toc.ncx", ncx(volume))?;
    }
    if let Some(c) = &cover {
        put("cover.xhtml", cover_xhtml(c))?;
    }
    if options.include_toc_page {
        put("toc.xhtml", toc_page_xhtml(volume))?;
    }
    for (i, ch) in volume.chapters.iter().enumerate() {
        put(
            &format!("chapter-{}.xhtml", i + 1),
            chapter_xhtml(ch, options.version),
        )?;
    }

    if let Some(c) = &cover {
        zip.start_file(format!("{}images/cover.{}", OEBPS_PREFIX, c.ext), deflate)?;
        zip.write_all(c.data)?;
    }

    Ok(zip.finish()?)
}

fn opf(
    volume: &Volume,
    cover: Option<&CoverImage<'_>>,
    options: &EpubOptions,
    with_ncx: bool,
) -> String {
    let epub3 = options.version == EpubVersion::Epub3;

    let mut metadata = format!(
        "    <dc:identifier id=\"book-id\">{}</dc:identifier>\n    <dc:title>{}</dc:title>\n    <dc:language>{}</dc:language>\n",
        xml_escape(&volume.identifier),
        xml_escape(&volume.title),
        xml_escape(if volume.language.trim().is_empty() { "en" } else { &volume.language }),
    );
    if let Some(author) = volume.author.as_deref().filter(|a| !a.trim().is_empty()) {
        metadata.push_str(&format!("    <dc:creator>{}</dc:creator>\n", xml_escape(author)));
    }
    if let Some(d) = volume.description.as_deref().filter(|d| !d.trim().is_empty()) {
        metadata.push_str(&format!("    <dc:description>{}</dc:description>\n", xml_escape(d)));
    }
    for subject in &volume.subjects {
        metadata.push_str(&format!("    <dc:subject>{}</dc:subject>\n", xml_escape(subject)));
    }
    if let Some(year) = volume.start_year {
        metadata.push_str(&format!("    <dc:date>{}</dc:date>\n", year));
        metadata.push_str(&format!("    <meta name=\"start-year\" content=\"{}\"/>\n", year));
    }
    if let Some(year) = volume.end_year {
        metadata.push_str(&format!("    <meta name=\"end-year\" content=\"{}\"/>\n", year));
    }
    if let Some(series) = &volume.series {
        metadata.push_str(&format!(
            "    <meta name=\"calibre:series\" content=\"{}\"/>\n    <meta name=\"calibre:series_index\" content=\"{}\"/>\n",
            xml_escape(&series.name),
            series.index
        ));
    }
    if cover.is_some() {
        metadata.push_str("    <meta name=\"cover\" content=\"cover-img\"/>\n");
    }

    let mut manifest = String::new();
    let mut item = |id: &str, href: &str, media_type: &str, properties: Option<&str>| {
        let props = properties
            .filter(|_| epub3)
            .map(|p| format!(" properties=\"{}\"", p))
            .unwrap_or_default();
        manifest.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"{}/>\n",
            id, href, media_type, props
        ));
    };
    if epub3 {
        item("nav", "nav.xhtml", "application/xhtml+xml", Some("nav"));
    }
    if with_ncx {
        item("ncx", "toc.ncx", "application/x-dtbncx+xml", None);
    }
    if let Some(c) = cover {
        item(
            "cover-img",
            &format!("images/cover.{}", c.ext),
            c.media_type,
            Some("cover-image"),
        );
        item("cover", "cover.xhtml", "application/xhtml+xml", None);
    }
    if options.include_toc_page {
        item("toc-page", "toc.xhtml", "application/xhtml+xml", None);
    }
    for i in 1..=volume.chapters.len() {
        item(
            &format!("chapter-{}", i),
            &format!("chapter-{}.xhtml", i),
            "application/xhtml+xml",
            None,
        );
    }

    let mut spine = Vec::new();
    if cover.is_some() {
        spine.push("    <itemref idref=\"cover\"/>".to_string());
    }
    if options.include_toc_page {
        spine.push("    <itemref idref=\"toc-page\"/>".to_string());
    }
    for i in 1..=volume.chapters.len() {
        spine.push(format!("    <itemref idref=\"chapter-{}\"/>", i));
    }
    let spine_open = if with_ncx {
        "<spine toc=\"ncx\">"
    } else {
        "<spine>"
    };
    let guide = if cover.is_some() {
        "  <guide>\n    <reference type=\"cover\" href=\"cover.xhtml\" title=\"Cover\"/>\n  </guide>\n"
    } else {
        ""
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="{version}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
{metadata}  </metadata>
  <manifest>
{manifest}  </manifest>
  {spine_open}
{spine}
  </spine>
{guide}</package>
"#,
        version = if epub3 { "3.0" } else { "2.0" },
        metadata = metadata,
        manifest = manifest,
        spine_open = spine_open,
        spine = spine.join("\n"),
        guide = guide,
    )
}

fn chapter_links(volume: &Volume, indent: &str) -> String {
    volume
        .chapters
        .iter()
        .enumerate()
        .map(|(i, ch)| {
            format!(
                "{}<li><a href=\"chapter-{}.xhtml\">{}</a></li>\n",
                indent,
                i + 1,
                xml_escape(&ch.title)
            )
        })
        .collect()
}

fn nav_xhtml(volume: &Volume) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
  <nav epub:type="toc">
    <h1>Contents</h1>
    <ol>
{links}    </ol>
  </nav>
</body>
</html>
"#,
        title = xml_escape(&volume.title),
        links = chapter_links(volume, "      "),
    )
}

fn toc_page_xhtml(volume: &Volume) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>Table of Contents</title>
</head>
<body>
  <h1>{title}</h1>
  <ol>
{links}  </ol>
</body>
</html>
"#,
        title = xml_escape(&volume.title),
        links = chapter_links(volume, "    "),
    )
}

fn ncx(volume: &Volume) -> String {
    let nav_points: String = volume
        .chapters
        .iter()
        .enumerate()
        .map(|(i, ch)| {
            format!(
                "    <navPoint id=\"navpoint-{n}\" playOrder=\"{n}\">\n      <navLabel><text>{label}</text></navLabel>\n      <content src=\"chapter-{n}.xhtml\"/>\n    </navPoint>\n",
                n = i + 1,
                label = xml_escape(&ch.title)
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{uid}"/>
  </head>
  <docTitle>
    <text>{title}</text>
  </docTitle>
  <navMap>
{nav_points}  </navMap>
</ncx>
"#,
        uid = xml_escape(&volume.identifier),
        title = xml_escape(&volume.title),
        nav_points = nav_points,
    )
}

fn cover_xhtml(cover: &CoverImage<'_>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>Cover</title>
</head>
<body>
  <div style="text-align: center;">
    <img src="images/cover.{}" alt="Cover" style="max-width: 100%; height: auto;"/>
  </div>
</body>
</html>
"#,
        cover.ext
    )
}

fn chapter_xhtml(ch: &VolumeChapter, version: EpubVersion) -> String {
    let doctype = match version {
        EpubVersion::Epub3 => "<!DOCTYPE html>",
        EpubVersion::Epub2 => {
            r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.1//EN" "http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd">"#
        }
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
{doctype}
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
{body}
</body>
</html>
"#,
        doctype = doctype,
        title = xml_escape(&ch.title),
        body = ch.body,
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
