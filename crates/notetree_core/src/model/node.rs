//! Node record domain model.
//!
//! # Responsibility
//! - Define the serializable value object carried by every tree node.
//! - Define the body payload and its anchored objects.
//!
//! # Invariants
//! - `id` is non-zero once a record is attached to a tree.
//! - `shared_master_id == 0` means the record owns its body.
//! - `body == None` means the body is not resident yet (lazy backends).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable node identifier inside one document.
pub type NodeId = u64;

/// Syntax tag persisted for rich-text nodes.
pub const RICH_TEXT_SYNTAX: &str = "custom-colors";
/// Syntax tag persisted for plain-text nodes.
pub const PLAIN_TEXT_SYNTAX: &str = "plain-text";

static RGB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#?([0-9a-fA-F]{6}|[0-9a-fA-F]{12})$").expect("valid rgb regex")
});

/// How the body of a node is interpreted by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Formatted text with anchored objects.
    RichText,
    /// Unformatted text.
    PlainText,
    /// Source code highlighted with the given language tag.
    Code(String),
}

impl ContentKind {
    /// Maps a persisted syntax tag to a content kind.
    pub fn from_syntax(syntax: &str) -> Self {
        match syntax.trim() {
            RICH_TEXT_SYNTAX => Self::RichText,
            "" | PLAIN_TEXT_SYNTAX => Self::PlainText,
            other => Self::Code(other.to_string()),
        }
    }

    /// Returns the persisted syntax tag.
    pub fn syntax(&self) -> &str {
        match self {
            Self::RichText => RICH_TEXT_SYNTAX,
            Self::PlainText => PLAIN_TEXT_SYNTAX,
            Self::Code(language) => language.as_str(),
        }
    }

    pub fn is_rich_text(&self) -> bool {
        matches!(self, Self::RichText)
    }
}

/// 24-bit RGB color used for the node name foreground override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parses `#rrggbb` or the 16-bit-per-channel `#rrrrggggbbbb` form.
    ///
    /// The leading `#` is optional. Returns `None` for anything else.
    pub fn parse(value: &str) -> Option<Self> {
        let captures = RGB_RE.captures(value.trim())?;
        let hex = captures.get(1)?.as_str();
        let step = hex.len() / 3;
        let channel = |index: usize| -> Option<u8> {
            let start = index * step;
            u8::from_str_radix(&hex[start..start + 2], 16).ok()
        };
        Some(Self::new(channel(0)?, channel(1)?, channel(2)?))
    }

    /// Packs the color as `0xRRGGBB`.
    pub fn to_u24(self) -> u32 {
        (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }

    /// Unpacks a `0xRRGGBB` value; bits above 24 are ignored.
    pub fn from_u24(value: u32) -> Self {
        Self::new(
            ((value >> 16) & 0xff) as u8,
            ((value >> 8) & 0xff) as u8,
            (value & 0xff) as u8,
        )
    }

    /// Formats as lowercase `#rrggbb`.
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Display for Rgb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Horizontal placement of an anchored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Justification {
    #[default]
    Left,
    Center,
    Right,
    Fill,
}

impl Justification {
    /// Parses the persisted token; unknown or empty values fall back to left.
    pub fn from_token(value: &str) -> Self {
        match value.trim() {
            "center" => Self::Center,
            "right" => Self::Right,
            "fill" => Self::Fill,
            _ => Self::Left,
        }
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Center => "center",
            Self::Right => "right",
            Self::Fill => "fill",
        }
    }
}

/// Anchored object category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchoredKind {
    Image,
    CodeBox,
    Table,
    File,
    Anchor,
}

/// Kind-specific anchored object payload.
///
/// The core never interprets these fields; they are carried verbatim between
/// the editor and the backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AnchoredPayload {
    Image {
        png: Vec<u8>,
        link: String,
    },
    File {
        filename: String,
        data: Vec<u8>,
        time: i64,
    },
    Anchor {
        name: String,
    },
    CodeBox {
        text: String,
        syntax: String,
        width: i64,
        height: i64,
        width_in_pixels: bool,
        highlight_brackets: bool,
        show_line_numbers: bool,
    },
    Table {
        content: String,
        col_min: i64,
        col_max: i64,
    },
}

/// Embedded non-text element placed at a character offset of a body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoredObject {
    /// Character offset inside the body text.
    pub offset: i64,
    pub justification: Justification,
    pub payload: AnchoredPayload,
}

impl AnchoredObject {
    pub fn new(offset: i64, payload: AnchoredPayload) -> Self {
        Self {
            offset,
            justification: Justification::Left,
            payload,
        }
    }

    pub fn kind(&self) -> AnchoredKind {
        match self.payload {
            AnchoredPayload::Image { .. } => AnchoredKind::Image,
            AnchoredPayload::File { .. } => AnchoredKind::File,
            AnchoredPayload::Anchor { .. } => AnchoredKind::Anchor,
            AnchoredPayload::CodeBox { .. } => AnchoredKind::CodeBox,
            AnchoredPayload::Table { .. } => AnchoredKind::Table,
        }
    }
}

/// Node body: opaque text plus anchored objects sorted by offset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Body {
    pub text: String,
    pub objects: Vec<AnchoredObject>,
}

impl Body {
    /// Creates a text-only body.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            objects: Vec::new(),
        }
    }

    /// Adds one anchored object keeping offset order stable.
    pub fn with_object(mut self, object: AnchoredObject) -> Self {
        self.objects.push(object);
        self.sort_objects();
        self
    }

    /// Sorts anchored objects by offset; equal offsets keep insertion order.
    pub fn sort_objects(&mut self) {
        self.objects.sort_by_key(|object| object.offset);
    }

    pub fn has_kind(&self, kind: AnchoredKind) -> bool {
        self.objects.iter().any(|object| object.kind() == kind)
    }
}

/// Serializable properties of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique non-zero id; `0` asks the tree to allocate one.
    pub id: NodeId,
    pub name: String,
    pub content_kind: ContentKind,
    /// Free-text, space separated tags.
    pub tags: String,
    pub is_read_only: bool,
    /// Presentation icon id; `0` means none.
    pub custom_icon_id: u32,
    pub is_bold: bool,
    pub foreground: Option<Rgb>,
    pub exclude_from_search: bool,
    pub exclude_children_from_search: bool,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
    /// Seconds since the Unix epoch.
    pub modified_at: i64,
    /// `0` when unshared, otherwise the id of the body owner.
    pub shared_master_id: NodeId,
    /// `None` when the body has not been loaded yet.
    pub body: Option<Body>,
}

impl NodeRecord {
    /// Creates an unattached record with an empty resident body.
    ///
    /// # Invariants
    /// - `id` is `0` until the tree assigns one.
    /// - Both timestamps are set to the current time.
    pub fn new(name: impl Into<String>, content_kind: ContentKind) -> Self {
        let now = now_epoch_secs();
        Self {
            id: 0,
            name: name.into(),
            content_kind,
            tags: String::new(),
            is_read_only: false,
            custom_icon_id: 0,
            is_bold: false,
            foreground: None,
            exclude_from_search: false,
            exclude_children_from_search: false,
            created_at: now,
            modified_at: now,
            shared_master_id: 0,
            body: Some(Body::default()),
        }
    }

    /// Creates a record carrying an id read from a file.
    ///
    /// Timestamps are zeroed and the body is left non-resident; loaders fill
    /// in what the physical format provides.
    pub fn with_id(id: NodeId, name: impl Into<String>, content_kind: ContentKind) -> Self {
        Self {
            id,
            created_at: 0,
            modified_at: 0,
            body: None,
            ..Self::new(name, content_kind)
        }
    }

    /// Sets the body and returns the record.
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_shared_member(&self) -> bool {
        self.shared_master_id != 0
    }

    /// Copies every scalar property except identity and sharing from `other`.
    pub fn copy_scalars_from(&mut self, other: &NodeRecord) {
        self.name = other.name.clone();
        self.content_kind = other.content_kind.clone();
        self.tags = other.tags.clone();
        self.is_read_only = other.is_read_only;
        self.custom_icon_id = other.custom_icon_id;
        self.is_bold = other.is_bold;
        self.foreground = other.foreground;
        self.exclude_from_search = other.exclude_from_search;
        self.exclude_children_from_search = other.exclude_children_from_search;
        self.created_at = other.created_at;
        self.modified_at = other.modified_at;
    }
}

/// Current time as seconds since the Unix epoch; `0` if the clock is broken.
pub fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{ContentKind, Justification, Rgb, PLAIN_TEXT_SYNTAX, RICH_TEXT_SYNTAX};

    #[test]
    fn content_kind_maps_syntax_tags() {
        assert_eq!(ContentKind::from_syntax(RICH_TEXT_SYNTAX), ContentKind::RichText);
        assert_eq!(ContentKind::from_syntax(PLAIN_TEXT_SYNTAX), ContentKind::PlainText);
        assert_eq!(ContentKind::from_syntax(""), ContentKind::PlainText);
        assert_eq!(
            ContentKind::from_syntax("rust"),
            ContentKind::Code("rust".to_string())
        );
        assert_eq!(ContentKind::Code("sh".to_string()).syntax(), "sh");
    }

    #[test]
    fn rgb_parses_short_and_long_forms() {
        assert_eq!(Rgb::parse("#ff8000"), Some(Rgb::new(0xff, 0x80, 0x00)));
        assert_eq!(Rgb::parse("00ff00"), Some(Rgb::new(0, 0xff, 0)));
        assert_eq!(Rgb::parse("#ffff80800000"), Some(Rgb::new(0xff, 0x80, 0x00)));
        assert_eq!(Rgb::parse("#fff"), None);
        assert_eq!(Rgb::parse(""), None);
    }

    #[test]
    fn rgb_u24_and_hex_agree() {
        let color = Rgb::new(0x12, 0x34, 0x56);
        assert_eq!(color.to_u24(), 0x123456);
        assert_eq!(Rgb::from_u24(0xff123456), color);
        assert_eq!(color.to_hex(), "#123456");
    }

    #[test]
    fn justification_falls_back_to_left() {
        assert_eq!(Justification::from_token("center"), Justification::Center);
        assert_eq!(Justification::from_token(""), Justification::Left);
        assert_eq!(Justification::from_token("diagonal"), Justification::Left);
    }
}
