//! Turns one MetaDirectory into zero or more commits plus zero or more
//! new MetaDirectories for the scheduler's queue.
//!
//! Grounded on the teacher's worker/writer split (`workers/mod.rs`:
//! produce candidates on worker threads, then commit sequentially) for
//! the "gather parses, then decide" shape, and on `extract/mod.rs`'s
//! offset-then-length ordering for the carving tie-break.

use std::collections::HashSet;
use std::fs;

use crate::error::{Result, TriageError};
use crate::meta_directory::{MetaDirectoryHandle, MetaDirectoryRef, MetaDirectoryStore};
use crate::parser::{
    parse_at_offset, ChildPlacement, Parser, ParserDescriptor, ParserError, ParserRegistry,
};

/// Summary of one dispatch call, returned for the scheduler to act on
/// and for tests to assert against.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub new_children: Vec<MetaDirectoryRef>,
    pub claimed_regions: usize,
    pub gap_count: usize,
    pub parser: Option<String>,
}

struct ParsedRegion {
    offset: u64,
    length: u64,
    descriptor: ParserDescriptor,
    parser: Box<dyn Parser>,
    registration_index: usize,
}

/// Dispatches `r`: reads its bytes, runs the signature/ordering/carving/
/// fallback procedure, commits its info, and returns the children now
/// queued for further dispatch.
pub fn dispatch(
    store: &MetaDirectoryStore,
    registry: &ParserRegistry,
    r: &MetaDirectoryRef,
) -> Result<DispatchOutcome> {
    let file_path = store.file_path(r)?;
    let bytes = fs::read(&file_path).map_err(|e| TriageError::io(e, file_path.clone()))?;
    let extension = file_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_string());

    tracing::debug!(meta_directory = %r, size = bytes.len(), "dispatching");

    store.open(r, true, |handle| {
        if bytes.is_empty() {
            handle.info.labels.insert("empty".to_string());
            tracing::debug!(meta_directory = %r, "empty input, short-circuited");
            return Ok(DispatchOutcome::default());
        }

        let claims = signature_pass(&bytes, registry);
        let kept = order_and_resolve(claims);
        let whole_file = kept.len() == 1 && kept[0].offset == 0 && kept[0].length == bytes.len() as u64;

        if whole_file {
            let region = kept.into_iter().next().expect("checked len == 1");
            let parser_name = region.descriptor.pretty_name.to_string();
            tracing::debug!(meta_directory = %r, parser = %parser_name, "whole-file claim");
            let children = apply_whole_file(store, handle, region)?;
            Ok(DispatchOutcome {
                new_children: children,
                claimed_regions: 1,
                gap_count: 0,
                parser: Some(parser_name),
            })
        } else if !kept.is_empty() {
            let claimed = kept.len();
            tracing::debug!(meta_directory = %r, claimed, "carving multiple regions");
            let (children, gap_count) = carve_multi(store, handle, kept, &bytes)?;
            Ok(DispatchOutcome {
                new_children: children,
                claimed_regions: claimed,
                gap_count,
                parser: Some("extractingparser".to_string()),
            })
        } else if let Some(region) = try_fallback(&bytes, registry, extension.as_deref()) {
            let parser_name = region.descriptor.pretty_name.to_string();
            tracing::debug!(meta_directory = %r, parser = %parser_name, "fallback claim");
            let children = apply_whole_file(store, handle, region)?;
            Ok(DispatchOutcome {
                new_children: children,
                claimed_regions: 1,
                gap_count: 0,
                parser: Some(parser_name),
            })
        } else {
            tracing::debug!(meta_directory = %r, "no parser claimed any region");
            Ok(DispatchOutcome::default())
        }
    })
}

/// Scans `bytes` for every registered signature and constructs a fresh
/// parser instance at each candidate start offset. Candidates whose
/// `parse()` rejects are discarded silently, matching the contract's
/// "fails with a `ParserError` ... any other exception is fatal" split —
/// here, any `ParserError` is simply dropped and only a `parse()` panic
/// (never expected, parsers are ordinary safe Rust) would propagate.
fn signature_pass(bytes: &[u8], registry: &ParserRegistry) -> Vec<ParsedRegion> {
    let mut seen_candidates: HashSet<(u64, usize)> = HashSet::new();
    let mut regions = Vec::new();

    for (idx, factory) in registry.iter() {
        let descriptor = factory.descriptor();
        for signature in descriptor.signatures {
            for pos in find_all(bytes, signature.magic) {
                let pos = pos as u64;
                if pos < signature.offset_within_file {
                    continue;
                }
                let start = pos - signature.offset_within_file;
                if !seen_candidates.insert((start, idx)) {
                    continue;
                }
                let mut parser = factory.construct();
                match parse_at_offset(parser.as_mut(), bytes, start) {
                    Ok(length) => regions.push(ParsedRegion {
                        offset: start,
                        length,
                        descriptor,
                        parser,
                        registration_index: idx,
                    }),
                    Err(_) => continue,
                }
            }
        }
    }
    regions
}

fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, w)| *w == needle)
        .map(|(i, _)| i)
        .collect()
}

/// Orders successful parses by starting offset ascending, then claimed
/// length descending, then registration order, then greedily keeps
/// non-overlapping claims — overlap resolves in favor of the
/// earlier-starting (and, at equal starts, longer) parse.
fn order_and_resolve(mut regions: Vec<ParsedRegion>) -> Vec<ParsedRegion> {
    regions.sort_by(|a, b| {
        a.offset
            .cmp(&b.offset)
            .then(b.length.cmp(&a.length))
            .then(a.registration_index.cmp(&b.registration_index))
    });

    let mut kept = Vec::new();
    let mut cursor = 0u64;
    for region in regions {
        if region.offset >= cursor {
            cursor = region.offset + region.length;
            kept.push(region);
        }
    }
    kept
}

fn try_fallback(
    bytes: &[u8],
    registry: &ParserRegistry,
    extension: Option<&str>,
) -> Option<ParsedRegion> {
    let mut candidates: Vec<(usize, &dyn crate::parser::ParserFactory)> = Vec::new();
    if let Some(ext) = extension {
        candidates.extend(registry.by_extension(ext).map(|f| (0usize, f)));
    }
    candidates.extend(registry.featureless().map(|f| (1usize, f)));

    for (registration_index, factory) in candidates {
        let mut parser = factory.construct();
        if let Ok(length) = parse_at_offset(parser.as_mut(), bytes, 0) {
            if length == bytes.len() as u64 {
                return Some(ParsedRegion {
                    offset: 0,
                    length,
                    descriptor: factory.descriptor(),
                    parser,
                    registration_index,
                });
            }
        }
    }
    None
}

/// A single parser claimed the whole file: its labels/metadata land
/// directly on `handle`, and its `unpack()` children are committed under
/// the parent's own children maps (the `ExtractedParser`/`ExtractingParser`
/// split from spec.md only applies when carving introduces an
/// intermediate layer, which a whole-file claim never does).
fn apply_whole_file(
    store: &MetaDirectoryStore,
    handle: &mut MetaDirectoryHandle<'_>,
    mut region: ParsedRegion,
) -> Result<Vec<MetaDirectoryRef>> {
    handle.info.unpack_parser = Some(region.descriptor.pretty_name.to_string());
    for label in region.parser.labels() {
        handle.info.labels.insert(label);
    }
    for (key, value) in region.parser.metadata() {
        handle.info.metadata.insert(key, value);
    }

    let mut new_children = Vec::new();
    for child in region.parser.unpack() {
        if child.placement == ChildPlacement::Symlink {
            handle
                .info
                .unpacked_symlinks
                .insert(child.logical_name, child.symlink_target.unwrap_or_default());
            continue;
        }

        let child_ref = store.create_child_from_bytes(&child.logical_name, &child.bytes)?;
        let subtree = match child.placement {
            ChildPlacement::Relative => "rel",
            ChildPlacement::Absolute => "abs",
            ChildPlacement::Extracted | ChildPlacement::Symlink => "rel",
        };
        store.materialize_link(handle.meta_ref(), subtree, &child.logical_name, &child_ref)?;
        match child.placement {
            ChildPlacement::Relative => handle
                .info
                .unpacked_relative_files
                .insert(child.logical_name, child_ref.0.clone()),
            ChildPlacement::Absolute => handle
                .info
                .unpacked_absolute_files
                .insert(child.logical_name, child_ref.0.clone()),
            ChildPlacement::Extracted | ChildPlacement::Symlink => handle
                .info
                .extracted_files
                .insert(child.logical_name, child_ref.0.clone()),
        };
        new_children.push(child_ref);
    }
    Ok(new_children)
}

/// Multiple independent regions were claimed directly against the
/// top-level bytes (no single container format covers everything): the
/// parent receives `ExtractingParser` treatment (it claims no bytes of
/// its own), each claimed region becomes an opaque carved child to be
/// reclassified on its own next dispatch, and each gap between/around
/// claims becomes a synthesized child.
fn carve_multi(
    store: &MetaDirectoryStore,
    handle: &mut MetaDirectoryHandle<'_>,
    kept: Vec<ParsedRegion>,
    bytes: &[u8],
) -> Result<(Vec<MetaDirectoryRef>, usize)> {
    handle.info.unpack_parser = Some("extractingparser".to_string());

    let mut new_children = Vec::new();
    let mut gap_count = 0usize;
    let mut cursor = 0u64;

    let mut emit_gap = |store: &MetaDirectoryStore,
                        handle: &mut MetaDirectoryHandle<'_>,
                        start: u64,
                        end: u64,
                        new_children: &mut Vec<MetaDirectoryRef>,
                        gap_count: &mut usize|
     -> Result<()> {
        let gap_bytes = &bytes[start as usize..end as usize];
        let name = format!("gap-{start:x}");
        let child = store.create_child_from_bytes(&name, gap_bytes)?;
        store.stamp_synthesized(&child)?;
        handle.info.extracted_files.insert(name.clone(), child.0.clone());
        store.materialize_link(handle.meta_ref(), "rel", &name, &child)?;
        new_children.push(child);
        *gap_count += 1;
        Ok(())
    };

    for region in &kept {
        if region.offset > cursor {
            emit_gap(store, handle, cursor, region.offset, &mut new_children, &mut gap_count)?;
        }
        let region_bytes = &bytes[region.offset as usize..(region.offset + region.length) as usize];
        let name = format!("part-{:x}", region.offset);
        let child = store.create_child_from_bytes(&name, region_bytes)?;
        handle.info.extracted_files.insert(name.clone(), child.0.clone());
        store.materialize_link(handle.meta_ref(), "rel", &name, &child)?;
        new_children.push(child);
        cursor = region.offset + region.length;
    }
    if cursor < bytes.len() as u64 {
        emit_gap(store, handle, cursor, bytes.len() as u64, &mut new_children, &mut gap_count)?;
    }

    Ok((new_children, gap_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::builtin::{PaddingParserFactory, ScriptParserFactory};
    use crate::parser::{ByteStream, ParserFactory, ParserRegistry, Signature};
    use std::io::Read;

    fn registry() -> ParserRegistry {
        let mut r = ParserRegistry::new();
        r.register(Box::new(ScriptParserFactory));
        r.register(Box::new(PaddingParserFactory));
        r
    }

    // Fixed-length mock formats used only to exercise the multi-region
    // carving path: unlike the built-in parsers, a real container format
    // (ELF, an archive member header, ...) claims an exact byte count
    // independent of what follows it in the stream.
    const MOCK_A_SIGS: &[Signature] = &[Signature {
        offset_within_file: 0,
        magic: b"AAAA",
    }];
    const MOCK_B_SIGS: &[Signature] = &[Signature {
        offset_within_file: 0,
        magic: b"BBBB",
    }];

    #[derive(Default)]
    struct MockParser {
        magic: &'static [u8],
        claimed_len: u64,
    }

    impl Parser for MockParser {
        fn descriptor(&self) -> ParserDescriptor {
            if self.magic == b"AAAA" {
                MockAFactory.descriptor()
            } else {
                MockBFactory.descriptor()
            }
        }

        fn parse(&mut self, stream: &mut ByteStream<'_>) -> std::result::Result<(), ParserError> {
            let mut buf = [0u8; 4];
            stream
                .read_exact(&mut buf)
                .map_err(|e| ParserError::new(e.to_string()))?;
            if buf != *self.magic {
                return Err(ParserError::new("magic mismatch"));
            }
            self.claimed_len = 10;
            Ok(())
        }

        fn calculate_unpacked_size(&mut self, _stream: &mut ByteStream<'_>) -> u64 {
            self.claimed_len
        }

        fn labels(&self) -> Vec<String> {
            vec![String::from_utf8_lossy(self.magic).to_lowercase()]
        }
    }

    struct MockAFactory;
    impl ParserFactory for MockAFactory {
        fn descriptor(&self) -> ParserDescriptor {
            ParserDescriptor {
                pretty_name: "mock_a",
                extensions: &[],
                signatures: MOCK_A_SIGS,
                scan_if_featureless: false,
            }
        }
        fn construct(&self) -> Box<dyn Parser> {
            Box::new(MockParser {
                magic: b"AAAA",
                claimed_len: 0,
            })
        }
    }

    struct MockBFactory;
    impl ParserFactory for MockBFactory {
        fn descriptor(&self) -> ParserDescriptor {
            ParserDescriptor {
                pretty_name: "mock_b",
                extensions: &[],
                signatures: MOCK_B_SIGS,
                scan_if_featureless: false,
            }
        }
        fn construct(&self) -> Box<dyn Parser> {
            Box::new(MockParser {
                magic: b"BBBB",
                claimed_len: 0,
            })
        }
    }

    fn mock_registry() -> ParserRegistry {
        let mut r = ParserRegistry::new();
        r.register(Box::new(MockAFactory));
        r.register(Box::new(MockBFactory));
        r
    }

    fn setup(bytes: &[u8]) -> (tempfile::TempDir, MetaDirectoryStore, MetaDirectoryRef) {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("input.bin");
        fs::write(&input, bytes).unwrap();
        let store = MetaDirectoryStore::open_root(tmp.path().join("store")).unwrap();
        let root = store.register_root(&input).unwrap();
        (tmp, store, root)
    }

    #[test]
    fn empty_input_is_short_circuited() {
        let (_tmp, store, root) = setup(b"");
        let outcome = dispatch(&store, &registry(), &root).unwrap();
        assert!(outcome.new_children.is_empty());
        let info = store.read_info(&root).unwrap();
        assert!(info.labels.contains("empty"));
    }

    #[test]
    fn padding_run_is_recognized_whole_file() {
        let (_tmp, store, root) = setup(&vec![0x00u8; 128]);
        let outcome = dispatch(&store, &registry(), &root).unwrap();
        assert_eq!(outcome.parser.as_deref(), Some("paddingparser"));
        assert!(outcome.new_children.is_empty());
        let info = store.read_info(&root).unwrap();
        assert!(info.labels.contains("padding"));
    }

    #[test]
    fn script_shebang_claims_whole_file() {
        let (_tmp, store, root) = setup(b"#!/bin/sh\necho hi\n");
        let outcome = dispatch(&store, &registry(), &root).unwrap();
        assert_eq!(outcome.parser.as_deref(), Some("scriptparser"));
        let info = store.read_info(&root).unwrap();
        assert!(info.labels.contains("script"));
        assert!(info.labels.contains("sh"));
    }

    #[test]
    fn concatenated_claims_with_gap_carve_into_three_children() {
        let mut bytes = b"AAAA123456".to_vec();
        bytes.extend(std::iter::repeat(0x00u8).take(8));
        bytes.extend(b"BBBB654321");
        let (_tmp, store, root) = setup(&bytes);

        let outcome = dispatch(&store, &mock_registry(), &root).unwrap();
        assert_eq!(outcome.parser.as_deref(), Some("extractingparser"));
        assert_eq!(outcome.claimed_regions, 2);
        assert_eq!(outcome.gap_count, 1);
        assert_eq!(outcome.new_children.len(), 3);

        let info = store.read_info(&root).unwrap();
        assert_eq!(info.unpack_parser.as_deref(), Some("extractingparser"));
        assert_eq!(info.extracted_files.len(), 3);
    }

    #[test]
    fn duplicate_children_share_one_meta_directory() {
        let (_tmp, store, _root) = setup(b"#!/bin/sh\necho a\n");
        let a = store.create_child_from_bytes("first", b"shared payload").unwrap();
        let b = store.create_child_from_bytes("second", b"shared payload").unwrap();
        assert_eq!(a, b);
    }
}
