//! XML document backend: full snapshot on every save.
//!
//! # Responsibility
//! - Parse a `notetree` document into records reported through a sink.
//! - Serialize the whole tree, bodies included, on every save.
//!
//! # Invariants
//! - Saves write a sibling temporary file and rename it over the target.
//! - Bodies are resident after populate; `fetch_body` is a no-op.
//! - Shared members carry `master_id` and no body elements.
//! - The root element is `notetree`. Node attributes and body elements keep
//!   the classic `.ctd` names, but files rooted at `cherrytree` are not
//!   accepted and files written here are not readable by tools expecting
//!   that root.

use super::{parse_bool, parse_int, LoadError, NodeSink, SaveError, StorageBackend};
use crate::config::StorageConfig;
use crate::model::node::{
    AnchoredObject, AnchoredPayload, Body, ContentKind, Justification, NodeId, NodeRecord, Rgb,
};
use crate::tree::sync::SyncPending;
use crate::tree::NoteTree;
use base64::Engine;
use log::{error, info, warn};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

const ROOT_TAG: &str = "notetree";
const NODE_TAG: &str = "node";
const BOOKMARKS_TAG: &str = "bookmarks";
const RICH_TEXT_TAG: &str = "rich_text";
const PNG_TAG: &str = "encoded_png";
const CODEBOX_TAG: &str = "codebox";
const TABLE_TAG: &str = "table";

/// Snapshot codec for `.ctd` / `.ctz` payloads.
#[derive(Debug, Clone)]
pub struct XmlBackend {
    config: StorageConfig,
}

impl XmlBackend {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }
}

impl StorageBackend for XmlBackend {
    fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn populate(&mut self, path: &Path, sink: &mut dyn NodeSink) -> Result<(), LoadError> {
        let started_at = Instant::now();
        let text = std::fs::read_to_string(path).map_err(|err| LoadError::io(path, err))?;
        let root = parse_document(&text).map_err(|message| LoadError::corrupt(path, message))?;
        if root.name != ROOT_TAG {
            return Err(LoadError::corrupt(
                path,
                format!("missing root container `{ROOT_TAG}`"),
            ));
        }

        let mut loaded = 0usize;
        for child in &root.children {
            match child.name.as_str() {
                NODE_TAG => loaded += load_subtree(path, child, sink)?,
                BOOKMARKS_TAG => sink.bookmarks_loaded(parse_bookmarks(child)),
                _ => {}
            }
        }
        info!(
            "event=doc_populate module=xml status=ok nodes={loaded} duration_ms={}",
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Always rewrites the whole file; `pending` and `full_rewrite` are
    /// irrelevant for a snapshot format.
    fn save(
        &mut self,
        path: &Path,
        tree: &NoteTree,
        _pending: &SyncPending,
        _full_rewrite: bool,
    ) -> Result<(), SaveError> {
        let started_at = Instant::now();
        let result = write_document(tree, self.config.xml_indent)
            .and_then(|bytes| write_atomically(path, &bytes));
        match &result {
            Ok(()) => info!(
                "event=doc_save module=xml status=ok nodes={} duration_ms={}",
                tree.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=doc_save module=xml status=error duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            ),
        }
        result
    }

    fn vacuum(&mut self, _path: &Path) -> Result<(), SaveError> {
        Ok(())
    }

    fn fetch_body(&self, _id: NodeId) -> Result<Option<Body>, LoadError> {
        Ok(None)
    }

    fn close(&mut self) {}
}

/// Minimal element tree built from reader events.
#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, String> {
        let mut element = Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs: Vec::new(),
            children: Vec::new(),
            text: String::new(),
        };
        for attr in start.attributes() {
            let attr = attr.map_err(|err| err.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| err.to_string())?
                .into_owned();
            element.attrs.push((key, value));
        }
        Ok(element)
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    fn attr_or_empty(&self, key: &str) -> &str {
        self.attr(key).unwrap_or("")
    }

    fn bool_attr(&self, key: &str) -> bool {
        self.attr(key).is_some_and(parse_bool)
    }

    fn int_attr(&self, key: &str) -> i64 {
        self.attr(key).and_then(parse_int).unwrap_or(0)
    }
}

impl Drop for XmlElement {
    // Flattens nested children so deep documents do not recurse on drop.
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut child) = pending.pop() {
            pending.append(&mut child.children);
        }
    }
}

fn parse_document(text: &str) -> Result<XmlElement, String> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    loop {
        let event = reader
            .read_event()
            .map_err(|err| format!("xml error at byte {}: {err}", reader.buffer_position()))?;
        match event {
            Event::Start(start) => stack.push(XmlElement::from_start(&start)?),
            Event::Empty(start) => {
                let element = XmlElement::from_start(&start)?;
                close_element(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| "unbalanced end tag".to_string())?;
                close_element(&mut stack, &mut root, element)?;
            }
            Event::Text(content) => {
                if let Some(current) = stack.last_mut() {
                    let unescaped = content.unescape().map_err(|err| err.to_string())?;
                    current.text.push_str(&unescaped);
                }
            }
            Event::CData(content) => {
                if let Some(current) = stack.last_mut() {
                    let raw = std::str::from_utf8(&content).map_err(|err| err.to_string())?;
                    current.text.push_str(raw);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err("unexpected end of document".to_string());
    }
    root.ok_or_else(|| format!("missing root container `{ROOT_TAG}`"))
}

fn close_element(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => return Err("more than one root element".to_string()),
        None => *root = Some(element),
    }
    Ok(())
}

/// Reports `top` and its nested nodes in document order; returns the count.
fn load_subtree(
    path: &Path,
    top: &XmlElement,
    sink: &mut dyn NodeSink,
) -> Result<usize, LoadError> {
    let mut loaded = 0usize;
    let mut stack: Vec<(&XmlElement, Option<NodeId>)> = vec![(top, None)];
    while let Some((element, parent)) = stack.pop() {
        let record = record_from_element(element)
            .map_err(|message| LoadError::corrupt(path, message))?;
        let id = sink.node_loaded(record, parent, None)?;
        loaded += 1;
        stack.extend(
            element
                .children
                .iter()
                .filter(|child| child.name == NODE_TAG)
                .rev()
                .map(|child| (child, Some(id))),
        );
    }
    Ok(loaded)
}

fn record_from_element(element: &XmlElement) -> Result<NodeRecord, String> {
    let id = match element.attr("unique_id") {
        Some(raw) => parse_int(raw)
            .and_then(|value| NodeId::try_from(value).ok())
            .ok_or_else(|| format!("unparsable unique_id `{raw}`"))?,
        None => 0,
    };
    let mut record = NodeRecord::with_id(
        id,
        element.attr_or_empty("name"),
        ContentKind::from_syntax(element.attr_or_empty("prog_lang")),
    );
    record.tags = element.attr_or_empty("tags").to_string();
    record.is_read_only = element.bool_attr("readonly");
    record.exclude_from_search = element.bool_attr("nosearch_me");
    record.exclude_children_from_search = element.bool_attr("nosearch_ch");
    record.custom_icon_id = u32::try_from(element.int_attr("custom_icon_id")).unwrap_or(0);
    record.is_bold = element.bool_attr("is_bold");
    record.foreground = Rgb::parse(element.attr_or_empty("foreground"));
    record.created_at = element.int_attr("ts_creation");
    record.modified_at = element.int_attr("ts_lastsave");
    record.shared_master_id = NodeId::try_from(element.int_attr("master_id")).unwrap_or(0);
    if !record.is_shared_member() {
        record.body = Some(body_from_element(element)?);
    }
    Ok(record)
}

fn body_from_element(element: &XmlElement) -> Result<Body, String> {
    let mut body = Body::default();
    for slot in &element.children {
        let offset = slot.int_attr("char_offset");
        let justification = Justification::from_token(slot.attr_or_empty("justification"));
        let payload = match slot.name.as_str() {
            RICH_TEXT_TAG => {
                body.text.push_str(&slot.text);
                continue;
            }
            PNG_TAG => png_payload(slot)?,
            CODEBOX_TAG => AnchoredPayload::CodeBox {
                text: slot.text.clone(),
                syntax: slot.attr_or_empty("syntax_highlighting").to_string(),
                width: slot.int_attr("frame_width"),
                height: slot.int_attr("frame_height"),
                width_in_pixels: slot.bool_attr("width_in_pixels"),
                highlight_brackets: slot.bool_attr("highlight_brackets"),
                show_line_numbers: slot.bool_attr("show_line_numbers"),
            },
            TABLE_TAG => AnchoredPayload::Table {
                content: slot.text.clone(),
                col_min: slot.int_attr("col_min"),
                col_max: slot.int_attr("col_max"),
            },
            _ => continue,
        };
        body.objects.push(AnchoredObject {
            offset,
            justification,
            payload,
        });
    }
    body.sort_objects();
    Ok(body)
}

fn png_payload(slot: &XmlElement) -> Result<AnchoredPayload, String> {
    if let Some(anchor) = slot.attr("anchor") {
        return Ok(AnchoredPayload::Anchor {
            name: anchor.to_string(),
        });
    }
    let data = base64::engine::general_purpose::STANDARD
        .decode(slot.text.trim())
        .map_err(|err| format!("invalid base64 payload: {err}"))?;
    match slot.attr("filename") {
        Some(filename) => Ok(AnchoredPayload::File {
            filename: filename.to_string(),
            data,
            time: slot.int_attr("time"),
        }),
        None => Ok(AnchoredPayload::Image {
            png: data,
            link: slot.attr_or_empty("link").to_string(),
        }),
    }
}

fn parse_bookmarks(element: &XmlElement) -> Vec<NodeId> {
    element
        .attr_or_empty("list")
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| {
            let parsed = parse_int(token).and_then(|value| NodeId::try_from(value).ok());
            if parsed.is_none() {
                warn!("event=bookmark_parse module=xml status=skip token_len={}", token.len());
            }
            parsed
        })
        .collect()
}

fn backend_error(err: impl Display) -> SaveError {
    SaveError::Backend(err.to_string())
}

fn bool_token(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn write_document(tree: &NoteTree, indent: usize) -> Result<Vec<u8>, SaveError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', indent);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(backend_error)?;
    writer
        .write_event(Event::Start(BytesStart::new(ROOT_TAG)))
        .map_err(backend_error)?;
    let mut steps: Vec<WriteStep> = tree
        .roots()
        .iter()
        .rev()
        .copied()
        .map(WriteStep::Open)
        .collect();
    while let Some(step) = steps.pop() {
        match step {
            WriteStep::Open(id) => {
                let children = write_node_start(&mut writer, tree, id)?;
                steps.push(WriteStep::Close);
                steps.extend(children.iter().rev().copied().map(WriteStep::Open));
            }
            WriteStep::Close => {
                writer
                    .write_event(Event::End(BytesEnd::new(NODE_TAG)))
                    .map_err(backend_error)?;
            }
        }
    }

    let list = tree
        .bookmarks()
        .as_slice()
        .iter()
        .map(NodeId::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut bookmarks = BytesStart::new(BOOKMARKS_TAG);
    bookmarks.push_attribute(("list", list.as_str()));
    writer
        .write_event(Event::Empty(bookmarks))
        .map_err(backend_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(ROOT_TAG)))
        .map_err(backend_error)?;
    Ok(writer.into_inner())
}

/// Pending work of the document writer.
#[derive(Debug, Clone, Copy)]
enum WriteStep {
    Open(NodeId),
    Close,
}

/// Writes the start tag and body of `id`; returns its children.
fn write_node_start<'t>(
    writer: &mut Writer<Vec<u8>>,
    tree: &'t NoteTree,
    id: NodeId,
) -> Result<&'t [NodeId], SaveError> {
    let node = tree
        .node(id)
        .ok_or_else(|| SaveError::Backend(format!("node {id} vanished during save")))?;
    let record = node.record();

    let mut start = BytesStart::new(NODE_TAG);
    start.push_attribute(("name", record.name.as_str()));
    start.push_attribute(("unique_id", record.id.to_string().as_str()));
    start.push_attribute(("prog_lang", record.content_kind.syntax()));
    start.push_attribute(("tags", record.tags.as_str()));
    start.push_attribute(("readonly", bool_token(record.is_read_only)));
    start.push_attribute(("nosearch_me", bool_token(record.exclude_from_search)));
    start.push_attribute(("nosearch_ch", bool_token(record.exclude_children_from_search)));
    start.push_attribute(("custom_icon_id", record.custom_icon_id.to_string().as_str()));
    start.push_attribute(("is_bold", bool_token(record.is_bold)));
    let foreground = record.foreground.map(Rgb::to_hex).unwrap_or_default();
    start.push_attribute(("foreground", foreground.as_str()));
    start.push_attribute(("ts_creation", record.created_at.to_string().as_str()));
    start.push_attribute(("ts_lastsave", record.modified_at.to_string().as_str()));
    if record.is_shared_member() {
        start.push_attribute(("master_id", record.shared_master_id.to_string().as_str()));
    }
    writer
        .write_event(Event::Start(start))
        .map_err(backend_error)?;

    if !record.is_shared_member() {
        let body = record
            .body
            .as_ref()
            .ok_or_else(|| SaveError::Backend(format!("body of node {id} is not loaded")))?;
        write_body(writer, body)?;
    }
    Ok(node.children())
}

fn write_body(writer: &mut Writer<Vec<u8>>, body: &Body) -> Result<(), SaveError> {
    write_text_element(writer, BytesStart::new(RICH_TEXT_TAG), &body.text)?;

    for object in &body.objects {
        let (tag, content) = match &object.payload {
            AnchoredPayload::Image { png, .. } => {
                (PNG_TAG, base64::engine::general_purpose::STANDARD.encode(png))
            }
            AnchoredPayload::File { data, .. } => {
                (PNG_TAG, base64::engine::general_purpose::STANDARD.encode(data))
            }
            AnchoredPayload::Anchor { .. } => (PNG_TAG, String::new()),
            AnchoredPayload::CodeBox { text, .. } => (CODEBOX_TAG, text.clone()),
            AnchoredPayload::Table { content, .. } => (TABLE_TAG, content.clone()),
        };
        let mut start = BytesStart::new(tag);
        start.push_attribute(("char_offset", object.offset.to_string().as_str()));
        start.push_attribute(("justification", object.justification.as_token()));
        match &object.payload {
            AnchoredPayload::Image { link, .. } => {
                start.push_attribute(("link", link.as_str()));
            }
            AnchoredPayload::File { filename, time, .. } => {
                start.push_attribute(("filename", filename.as_str()));
                start.push_attribute(("time", time.to_string().as_str()));
            }
            AnchoredPayload::Anchor { name } => {
                start.push_attribute(("anchor", name.as_str()));
            }
            AnchoredPayload::CodeBox {
                syntax,
                width,
                height,
                width_in_pixels,
                highlight_brackets,
                show_line_numbers,
                ..
            } => {
                start.push_attribute(("frame_width", width.to_string().as_str()));
                start.push_attribute(("frame_height", height.to_string().as_str()));
                start.push_attribute(("width_in_pixels", bool_token(*width_in_pixels)));
                start.push_attribute(("syntax_highlighting", syntax.as_str()));
                start.push_attribute(("highlight_brackets", bool_token(*highlight_brackets)));
                start.push_attribute(("show_line_numbers", bool_token(*show_line_numbers)));
            }
            AnchoredPayload::Table {
                col_min, col_max, ..
            } => {
                start.push_attribute(("col_min", col_min.to_string().as_str()));
                start.push_attribute(("col_max", col_max.to_string().as_str()));
            }
        }
        write_text_element(writer, start, &content)?;
    }
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    start: BytesStart<'_>,
    text: &str,
) -> Result<(), SaveError> {
    if text.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(backend_error);
    }
    let end = BytesEnd::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    writer
        .write_event(Event::Start(start))
        .map_err(backend_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(backend_error)?;
    writer.write_event(Event::End(end)).map_err(backend_error)?;
    Ok(())
}

/// Writes `bytes` next to `path`, flushes them to disk and renames the
/// result over `path`.
///
/// The sibling name is fixed; one document has one writer at a time.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), SaveError> {
    let temp_path = super::temp_sibling(path);
    let written = File::create(&temp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(SaveError::io(&temp_path, err));
    }
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(SaveError::io(path, err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_document, write_atomically};

    #[test]
    fn parser_builds_nested_elements_and_keeps_text() {
        let root = parse_document(
            r#"<?xml version="1.0"?><notetree><node name="a &amp; b"><rich_text>x &lt; y</rich_text></node><bookmarks list="1"/></notetree>"#,
        )
        .unwrap();
        assert_eq!(root.name, "notetree");
        assert_eq!(root.children.len(), 2);
        let node = &root.children[0];
        assert_eq!(node.attr("name"), Some("a & b"));
        assert_eq!(node.children[0].text, "x < y");
    }

    #[test]
    fn parser_rejects_truncated_documents() {
        assert!(parse_document("<notetree><node>").is_err());
        assert!(parse_document("").is_err());
        assert!(parse_document("<a/><b/>").is_err());
    }

    #[test]
    fn atomic_write_replaces_target_and_leaves_no_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.ctd");
        std::fs::write(&path, "old").unwrap();

        write_atomically(&path, b"new content").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new content");
        assert!(!dir.path().join("doc.ctd.tmp").exists());
    }
}
