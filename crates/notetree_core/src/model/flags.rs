//! Packed integer encodings used by the relational document format.
//!
//! # Responsibility
//! - Encode/decode node flags that share one integer column.
//!
//! # Invariants
//! - `is_ro` column: bit 0 = read-only, bits 1.. = custom icon id.
//! - `is_richtxt` column: bit 0 = rich text, bit 1 = bold,
//!   bit 2 = foreground override, bits 3..=26 = 24-bit RGB.
//! - `level` column: bit 0 = exclude node from search,
//!   bit 1 = exclude children from search.
//! - Every `pack_*` / `unpack_*` pair round-trips.

use crate::model::node::Rgb;

const READ_ONLY_BIT: i64 = 0x01;
const ICON_SHIFT: u32 = 1;

const RICH_TEXT_BIT: i64 = 0x01;
const BOLD_BIT: i64 = 0x02;
const FOREGROUND_BIT: i64 = 0x04;
const FOREGROUND_SHIFT: u32 = 3;
const RGB24_MASK: i64 = 0xff_ffff;

const EXCLUDE_SELF_BIT: i64 = 0x01;
const EXCLUDE_CHILDREN_BIT: i64 = 0x02;

/// Packs read-only flag and custom icon id into the `is_ro` column.
pub fn pack_read_only_icon(is_read_only: bool, custom_icon_id: u32) -> i64 {
    let mut packed = i64::from(custom_icon_id) << ICON_SHIFT;
    if is_read_only {
        packed |= READ_ONLY_BIT;
    }
    packed
}

/// Unpacks the `is_ro` column into `(is_read_only, custom_icon_id)`.
pub fn unpack_read_only_icon(packed: i64) -> (bool, u32) {
    let is_read_only = packed & READ_ONLY_BIT != 0;
    let custom_icon_id = ((packed >> ICON_SHIFT) & i64::from(u32::MAX)) as u32;
    (is_read_only, custom_icon_id)
}

/// Decoded `is_richtxt` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StyleFlags {
    pub is_rich_text: bool,
    pub is_bold: bool,
    pub foreground: Option<Rgb>,
}

/// Packs rich-text, bold and foreground into the `is_richtxt` column.
pub fn pack_style(flags: StyleFlags) -> i64 {
    let mut packed = 0;
    if flags.is_rich_text {
        packed |= RICH_TEXT_BIT;
    }
    if flags.is_bold {
        packed |= BOLD_BIT;
    }
    if let Some(color) = flags.foreground {
        packed |= FOREGROUND_BIT;
        packed |= i64::from(color.to_u24()) << FOREGROUND_SHIFT;
    }
    packed
}

/// Unpacks the `is_richtxt` column.
pub fn unpack_style(packed: i64) -> StyleFlags {
    let foreground = if packed & FOREGROUND_BIT != 0 {
        Some(Rgb::from_u24(
            ((packed >> FOREGROUND_SHIFT) & RGB24_MASK) as u32,
        ))
    } else {
        None
    };
    StyleFlags {
        is_rich_text: packed & RICH_TEXT_BIT != 0,
        is_bold: packed & BOLD_BIT != 0,
        foreground,
    }
}

/// Packs the search exclusion flags into the `level` column.
pub fn pack_search_exclusion(exclude_self: bool, exclude_children: bool) -> i64 {
    let mut packed = 0;
    if exclude_self {
        packed |= EXCLUDE_SELF_BIT;
    }
    if exclude_children {
        packed |= EXCLUDE_CHILDREN_BIT;
    }
    packed
}

/// Unpacks the `level` column into `(exclude_self, exclude_children)`.
pub fn unpack_search_exclusion(packed: i64) -> (bool, bool) {
    (
        packed & EXCLUDE_SELF_BIT != 0,
        packed & EXCLUDE_CHILDREN_BIT != 0,
    )
}
