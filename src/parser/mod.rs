//! The contract every format-specific parser implements.
//!
//! Concrete format decoders (RPM, ELF, ...) are external collaborators —
//! this module only defines the shape they plug into: a static descriptor
//! used for registry lookups, and the per-instance operations the
//! dispatcher drives. A parser never sees where in a host file its bytes
//! live; it only ever sees a byte slice rebased to its own region, via
//! [`crate::offset_stream::OffsetStream`].

pub mod builtin;

use std::io::{Cursor, Read};

use serde_json::{Map, Value};

use crate::offset_stream::OffsetStream;

/// A stream over one parser's candidate region, rebased to offset 0.
pub type ByteStream<'a> = OffsetStream<Cursor<&'a [u8]>>;

/// A single `(offset_within_file, magic_bytes)` signature entry.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub offset_within_file: u64,
    pub magic: &'static [u8],
}

/// Static facts about a parser, independent of any particular instance.
/// This is the registry's lookup key: signature/extension/featureless.
#[derive(Debug, Clone, Copy)]
pub struct ParserDescriptor {
    pub pretty_name: &'static str,
    pub extensions: &'static [&'static str],
    pub signatures: &'static [Signature],
    pub scan_if_featureless: bool,
}

/// A parser's verdict that the bytes are not its format. Non-fatal — the
/// dispatcher discards the candidate and moves to the next one. Any other
/// error surfaces as [`crate::error::TriageError::ParserFatal`].
#[derive(Debug, Clone)]
pub struct ParserError(pub String);

impl ParserError {
    pub fn new(reason: impl Into<String>) -> Self {
        ParserError(reason.into())
    }
}

impl std::fmt::Display for ParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParserError {}

/// Where a child produced by [`Parser::unpack`] is recorded in the
/// parent's info: which children map it lands in, or whether it is a
/// symlink entry that names no backing MetaDirectory at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPlacement {
    Extracted,
    Relative,
    Absolute,
    Symlink,
}

/// One child a parser's `unpack` step produced.
#[derive(Debug, Clone)]
pub struct UnpackedChild {
    pub logical_name: String,
    pub placement: ChildPlacement,
    pub bytes: Vec<u8>,
    /// Only meaningful when `placement == Symlink`: the link target string,
    /// recorded verbatim and never followed by the core.
    pub symlink_target: Option<String>,
}

impl UnpackedChild {
    pub fn extracted(logical_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            logical_name: logical_name.into(),
            placement: ChildPlacement::Extracted,
            bytes,
            symlink_target: None,
        }
    }

    pub fn relative(logical_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            logical_name: logical_name.into(),
            placement: ChildPlacement::Relative,
            bytes,
            symlink_target: None,
        }
    }

    pub fn absolute(logical_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            logical_name: logical_name.into(),
            placement: ChildPlacement::Absolute,
            bytes,
            symlink_target: None,
        }
    }

    pub fn symlink(logical_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            placement: ChildPlacement::Symlink,
            bytes: Vec::new(),
            symlink_target: Some(target.into()),
        }
    }
}

/// Per-instance operations, constructed fresh for every candidate offset
/// the dispatcher tries.
pub trait Parser: Send {
    fn descriptor(&self) -> ParserDescriptor;

    /// Validate and decode. A non-matching format returns `Err(ParserError)`;
    /// this is expected and silent at the call site.
    fn parse(&mut self, stream: &mut ByteStream<'_>) -> Result<(), ParserError>;

    /// Consumed byte count after a successful parse. Default mirrors the
    /// base contract: the stream's current position.
    fn calculate_unpacked_size(&mut self, stream: &mut ByteStream<'_>) -> u64 {
        stream.tell().unwrap_or(0)
    }

    /// Children this parser extracts from its own region, already decided
    /// (name, placement, bytes) — committing them to the store is the
    /// dispatcher's job, not the parser's.
    fn unpack(&mut self) -> Vec<UnpackedChild> {
        Vec::new()
    }

    fn labels(&self) -> Vec<String> {
        Vec::new()
    }

    fn metadata(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Constructs fresh [`Parser`] instances and carries their static
/// descriptor. One factory per registered format.
pub trait ParserFactory: Send + Sync {
    fn descriptor(&self) -> ParserDescriptor;
    fn construct(&self) -> Box<dyn Parser>;
}

/// Index over all registered parsers, keyed by signature and extension.
pub struct ParserRegistry {
    factories: Vec<Box<dyn ParserFactory>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// A registry seeded with the built-in example parsers (padding,
    /// shebang scripts). Concrete format parsers are out of scope and are
    /// registered by callers that have them.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(builtin::PaddingParserFactory));
        registry.register(Box::new(builtin::ScriptParserFactory));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn ParserFactory>) {
        self.factories.push(factory);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &dyn ParserFactory)> {
        self.factories
            .iter()
            .enumerate()
            .map(|(i, f)| (i, f.as_ref()))
    }

    pub fn by_extension<'a>(&'a self, ext: &str) -> impl Iterator<Item = &'a dyn ParserFactory> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.factories.iter().map(|b| b.as_ref()).filter(move |f| {
            f.descriptor()
                .extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
    }

    pub fn featureless(&self) -> impl Iterator<Item = &dyn ParserFactory> {
        self.factories
            .iter()
            .map(|b| b.as_ref())
            .filter(|f| f.descriptor().scan_if_featureless)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `parser.parse()` then `calculate_unpacked_size()` against the
/// region of `bytes` starting at `start`, exactly as the dispatcher's
/// `parse_from_offset` step does: seek to 0 relative to the OffsetStream,
/// parse, size, assert non-empty.
pub fn parse_at_offset(
    parser: &mut dyn Parser,
    bytes: &[u8],
    start: u64,
) -> Result<u64, ParserError> {
    let region = &bytes[start as usize..];
    let cursor = Cursor::new(region);
    let mut stream =
        OffsetStream::new(cursor, 0).map_err(|e| ParserError::new(e.to_string()))?;
    parser.parse(&mut stream)?;
    let size = parser.calculate_unpacked_size(&mut stream);
    if size == 0 {
        return Err(ParserError::new("parser reported zero-length unpacked size"));
    }
    Ok(size)
}

/// Reads the whole remaining stream, for parsers (shebang scripts,
/// padding runs) that need to inspect content rather than a fixed header.
pub fn read_remaining(stream: &mut ByteStream<'_>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    Ok(buf)
}
