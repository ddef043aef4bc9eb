//! OPML 2.0 import and export, folder-aware.
//!
//! An `<outline>` with an `xmlUrl` attribute is a feed; one without is a
//! folder, and feeds inherit the innermost enclosing folder's name. Export
//! reverses the mapping, nesting each folder's feeds under one outline.

use std::collections::HashMap;

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::util::validate_url;

/// Nesting deeper than this is rejected outright; hand-written OPML never
/// comes close, and a malicious file should not get to choose our stack
/// depth.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A feed subscription extracted from (or destined for) an OPML file.
#[derive(Debug, Clone, PartialEq)]
pub struct OpmlFeed {
    /// From the `title` attribute, falling back to `text`, then to the URL.
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    /// Name of the innermost enclosing folder outline, if any.
    pub folder: Option<String>,
}

/// Attributes of one `<outline>` element, before it is classified as a
/// feed or a folder.
struct Outline {
    title: Option<String>,
    xml_url: Option<String>,
    html_url: Option<String>,
}

impl Outline {
    fn name(&self) -> Option<&str> {
        self.title.as_deref().filter(|t| !t.is_empty())
    }
}

/// Reads and parses an OPML file from disk.
pub async fn parse(path: &str) -> Result<Vec<OpmlFeed>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    parse_opml_content(&content)
}

/// Parses OPML content, returning every feed outline with its folder.
///
/// Feeds whose URL fails validation (non-HTTP scheme, localhost, private
/// address) are skipped with a warning rather than failing the import.
///
/// XXE is structurally impossible here: quick-xml does not parse
/// `<!ENTITY>` declarations, and `decode_and_unescape_value()` resolves
/// only the five XML builtins, so a custom entity reference is an error
/// instead of an expansion.
fn parse_opml_content(content: &str) -> Result<Vec<OpmlFeed>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    // Parallel stacks: every open outline records whether it contributed a
    // folder name, so End events know what to pop.
    let mut folder_stack: Vec<String> = Vec::new();
    let mut open_outlines: Vec<bool> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if open_outlines.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }

                let outline = parse_outline_attributes(&e, &reader)?;
                let is_folder = outline.xml_url.is_none();
                if is_folder {
                    if let Some(name) = outline.name() {
                        folder_stack.push(name.to_owned());
                        open_outlines.push(true);
                    } else {
                        // A nameless folder adds no context.
                        open_outlines.push(false);
                    }
                } else {
                    open_outlines.push(false);
                    if let Some(feed) = to_feed(outline, folder_stack.last()) {
                        feeds.push(feed);
                    }
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = parse_outline_attributes(&e, &reader)?;
                if let Some(feed) = to_feed(outline, folder_stack.last()) {
                    feeds.push(feed);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                if open_outlines.pop() == Some(true) {
                    folder_stack.pop();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(feeds)
}

fn parse_outline_attributes(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Outline> {
    let mut title = None;
    let mut text = None;
    let mut xml_url = None;
    let mut html_url = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        match attr.key.as_ref() {
            b"title" => title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"text" => text = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"xmlUrl" => xml_url = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"htmlUrl" => {
                let url = attr.decode_and_unescape_value(decoder)?;
                match validate_url(&url) {
                    Ok(_) => html_url = Some(url.to_string()),
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "Ignoring invalid htmlUrl in OPML");
                    }
                }
            }
            _ => {}
        }
    }

    Ok(Outline {
        title: title.or(text),
        xml_url,
        html_url,
    })
}

fn to_feed(outline: Outline, folder: Option<&String>) -> Option<OpmlFeed> {
    let url = outline.xml_url?;
    match validate_url(&url) {
        Ok(_) => Some(OpmlFeed {
            title: outline.title.unwrap_or_else(|| url.clone()),
            xml_url: url,
            html_url: outline.html_url,
            folder: folder.cloned(),
        }),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
            None
        }
    }
}

/// Renders feeds as an OPML 2.0 document, one outline per folder.
///
/// Folders appear in order of first use; feeds without a folder sit
/// directly under `<body>`.
pub fn export_opml(feeds: &[OpmlFeed]) -> Result<String> {
    use std::io::Cursor;

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(BytesText::new("millrace subscriptions")))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    // Group by folder, keeping the order folders first appear in.
    let mut order: Vec<Option<&str>> = Vec::new();
    let mut grouped: HashMap<Option<&str>, Vec<&OpmlFeed>> = HashMap::new();
    for feed in feeds {
        let key = feed.folder.as_deref();
        if !grouped.contains_key(&key) {
            order.push(key);
        }
        grouped.entry(key).or_default().push(feed);
    }

    for key in order {
        let members = &grouped[&key];
        match key {
            Some(folder) => {
                let mut outline = BytesStart::new("outline");
                outline.push_attribute(("text", folder));
                outline.push_attribute(("title", folder));
                writer
                    .write_event(Event::Start(outline))
                    .context("Failed to write folder outline")?;
                for feed in members {
                    write_feed_outline(&mut writer, feed)?;
                }
                writer
                    .write_event(Event::End(BytesEnd::new("outline")))
                    .context("Failed to write folder outline end")?;
            }
            None => {
                for feed in members {
                    write_feed_outline(&mut writer, feed)?;
                }
            }
        }
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

fn write_feed_outline<W: std::io::Write>(writer: &mut Writer<W>, feed: &OpmlFeed) -> Result<()> {
    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("text", feed.title.as_str()));
    outline.push_attribute(("title", feed.title.as_str()));
    outline.push_attribute(("xmlUrl", feed.xml_url.as_str()));
    if let Some(ref html_url) = feed.html_url {
        outline.push_attribute(("htmlUrl", html_url.as_str()));
    }
    writer
        .write_event(Event::Empty(outline))
        .context("Failed to write outline element")?;
    Ok(())
}

/// Writes an OPML export atomically: temp file in the target directory,
/// sync, then rename, so the destination never holds a partial document.
pub fn export_to_file(feeds: &[OpmlFeed], path: &std::path::Path) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_opml(feeds)?;

    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions",
                temp_path.display()
            )
        })?;

    std::io::Write::write_all(&mut file, content.as_bytes()).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to write OPML to temporary file '{}'",
            temp_path.display()
        )
    })?;

    file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to sync temporary file '{}' to disk",
            temp_path.display()
        )
    })?;

    drop(file);

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
