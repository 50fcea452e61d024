//! Payload codecs.
//!
//! # Data Flow
//! ```text
//! Value tree
//!     → json.rs    (textual, `%...%` tag marker)
//!     → bencode.rs (length-prefixed, canonical key order, `s...e` tag marker)
//!     → biton.rs   (bit-packed, 3-bit type tags)
//!     → bytes handed to a frame protocol
//! ```
//!
//! # Design Decisions
//! - Codecs are pure transcoders; failure is a `None`, never a panic
//! - Decoders refuse input nested deeper than [`MAX_DEPTH`]
//! - Tagged objects round-trip through an explicit [`TagRegistry`]
//! - One codec instance is shared by a tunnel and its frame protocol

pub mod bencode;
pub mod biton;
mod bits;
pub mod json;
pub mod registry;
pub mod value;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use bencode::BencodeCodec;
pub use biton::BitonCodec;
pub use json::JsonCodec;
pub use registry::{Blob, Serializable, TagRegistry};
pub use value::{HeaderMap, Tagged, Value};

/// Deepest nesting of arrays, maps and tags a decoder accepts.
pub const MAX_DEPTH: usize = 512;

/// A value-tree transcoder.
pub trait Codec: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Whether encoded output is arbitrary bytes rather than UTF-8 text.
    fn is_binary(&self) -> bool {
        false
    }

    fn encode(&self, value: &Value) -> Option<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Option<Value>;
}

/// Codec selection as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Json,
    Bencode,
    Biton,
}

impl CodecKind {
    /// Build the codec with the given tag registry.
    pub fn build(self, registry: Arc<TagRegistry>) -> Arc<dyn Codec> {
        match self {
            CodecKind::Json => Arc::new(JsonCodec::new(registry)),
            CodecKind::Bencode => Arc::new(BencodeCodec::new(registry)),
            CodecKind::Biton => Arc::new(BitonCodec::new(registry)),
        }
    }
}

/// Decimal rendering shared by the textual codecs: never uses exponent
/// notation and always carries a `.` so floats stay floats on decode.
pub(crate) fn format_float(value: f64) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    let mut text = value.to_string();
    if !text.contains('.') {
        text.push_str(".0");
    }
    Some(text)
}
