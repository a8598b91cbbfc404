//! Identifier extraction: walks a finished meta-directory store, harvests
//! strings/functions/variables from `elf`- and `dex`-labeled
//! MetaDirectories, and applies the quality filters and heuristics
//! spec.md §4.6 describes.
//!
//! Grounded line-for-line on `yara_from_bang.py`'s two extraction
//! branches (`'elf' in labels` / `'dex' in labels`). The real ELF/Dex
//! decoders are external collaborators (spec.md §1) — this module reads
//! only the `metadata` JSON shape they are expected to produce
//! (`strings`, `symbols[].{name,type,section_index,binding}` for ELF;
//! `classes[].{methods[].{name,strings}, fields[].name}` for Dex), so it
//! can be exercised in tests without a real parser.

pub mod denylist;
pub mod rules;

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::config::Config;
use crate::identifier::denylist::Denylist;
use crate::meta_directory::{MetaDirectoryRef, MetaDirectoryStore, MetaInfo};

/// `str.translate(ESCAPE)` from `yara_from_bang.py`: quote, backslash,
/// tab, newline become their YARA string-literal escapes.
pub fn escape_yara_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn whitespace_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+$").unwrap())
}

fn is_whitespace_only(s: &str) -> bool {
    whitespace_only_re().is_match(s)
}

/// Strips an ELF symbol version suffix: `foo@@GLIBC_2.2.5` -> `foo`,
/// `foo@GLIBC_PRIVATE` -> `foo`. Split on `@@` first, then `@`, exactly
/// as the source does.
fn strip_version_suffix(name: &str) -> &str {
    if let Some((base, _)) = name.split_once("@@") {
        base
    } else if let Some((base, _)) = name.split_once('@') {
        base
    } else {
        name
    }
}

/// Three identifier groups extracted from one file.
#[derive(Debug, Clone, Default)]
pub struct ExtractedIdentifiers {
    pub strings: BTreeSet<String>,
    pub functions: BTreeSet<String>,
    pub variables: BTreeSet<String>,
}

impl ExtractedIdentifiers {
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.functions.is_empty() && self.variables.is_empty()
    }

    /// Drops any group whose extracted count is below
    /// `heuristics.{group}.extracted`, per spec.md §4.6 and the source's
    /// `if len(strings) < heuristics['strings_extracted']: strings =
    /// set()` gate.
    fn apply_extracted_gate(&mut self, config: &Config) {
        if self.strings.len() < config.heuristics.strings.extracted {
            self.strings.clear();
        }
        if self.functions.len() < config.heuristics.functions.extracted {
            self.functions.clear();
        }
        if self.variables.len() < config.heuristics.variables.extracted {
            self.variables.clear();
        }
    }
}

fn filtered_strings(values: &[Value], config: &Config) -> BTreeSet<String> {
    values
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|s| s.len() >= config.string_min_cutoff && s.len() <= config.string_max_cutoff)
        .filter(|s| !is_whitespace_only(s))
        .map(escape_yara_string)
        .collect()
}

fn as_array<'a>(metadata: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    metadata
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[])
}

/// Extracts strings, function symbols, and variable (object) symbols from
/// an ELF `metadata` document. Grounded on `yara_from_bang.py`'s
/// `'elf' in bang_data[...]['labels']` branch.
pub fn extract_elf(
    metadata: &Map<String, Value>,
    config: &Config,
    denylist: &Denylist,
) -> ExtractedIdentifiers {
    let mut out = ExtractedIdentifiers::default();
    out.strings = filtered_strings(as_array(metadata, "strings"), config);

    for symbol in as_array(metadata, "symbols") {
        let Some(symbol) = symbol.as_object() else {
            continue;
        };
        let section_index = symbol.get("section_index").and_then(|v| v.as_i64()).unwrap_or(0);
        if section_index == 0 {
            continue;
        }
        if config.ignore_weak_symbols
            && symbol.get("binding").and_then(|v| v.as_str()) == Some("weak")
        {
            continue;
        }
        let Some(name) = symbol.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        if name.len() < config.identifier_cutoff {
            continue;
        }
        let name = strip_version_suffix(name);
        match symbol.get("type").and_then(|v| v.as_str()) {
            Some("func") => {
                if !denylist.elf.functions.contains(name) {
                    out.functions.insert(name.to_string());
                }
            }
            Some("object") => {
                if !denylist.elf.variables.contains(name) {
                    out.variables.insert(name.to_string());
                }
            }
            _ => {}
        }
    }

    out.apply_extracted_gate(config);
    out
}

/// Extracts method names, per-method string tables, and field names from
/// a Dex `metadata` document (`classes[].{methods[].{name,strings},
/// fields[].name}`). Grounded on `yara_from_bang.py`'s
/// `'dex' in bang_data[...]['labels']` branch.
pub fn extract_dex(
    metadata: &Map<String, Value>,
    config: &Config,
    denylist: &Denylist,
) -> ExtractedIdentifiers {
    let mut out = ExtractedIdentifiers::default();

    for class in as_array(metadata, "classes") {
        let Some(class) = class.as_object() else {
            continue;
        };
        for method in as_array(class, "methods") {
            let Some(method) = method.as_object() else {
                continue;
            };
            if let Some(name) = method.get("name").and_then(|v| v.as_str()) {
                if name.len() >= config.identifier_cutoff
                    && !is_whitespace_only(name)
                    && name != "<init>"
                    && name != "<clinit>"
                    && !name.starts_with("access$")
                    && !denylist.dex.functions.contains(name)
                {
                    out.functions.insert(name.to_string());
                }
            }
            out.strings
                .extend(filtered_strings(as_array(method, "strings"), config));
        }
        for field in as_array(class, "fields") {
            let Some(field) = field.as_object() else {
                continue;
            };
            if let Some(name) = field.get("name").and_then(|v| v.as_str()) {
                if name.len() >= config.identifier_cutoff
                    && !is_whitespace_only(name)
                    && !denylist.dex.variables.contains(name)
                {
                    out.variables.insert(name.to_string());
                }
            }
        }
    }

    out.apply_extracted_gate(config);
    out
}

/// One file's extracted identifiers plus the metadata a rule needs:
/// logical name, content hash, and (ELF only) similarity hashes.
#[derive(Debug, Clone)]
pub struct FileIdentifiers {
    pub meta_ref: MetaDirectoryRef,
    pub name: String,
    pub language: &'static str,
    pub tlsh: Option<String>,
    pub telfhash: Option<String>,
    pub identifiers: ExtractedIdentifiers,
}

fn metadata_string(metadata: &Map<String, Value>, key: &str) -> Option<String> {
    metadata.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Extracts identifiers for one already-read MetaDirectory info record,
/// if it carries an `elf` or `dex` label. Returns `None` for anything
/// else, when extraction yields nothing (spec.md: "an empty identifier
/// set suppresses rule emission"), or when `config.ignore_ocaml` is set
/// and the file is labeled `ocaml` (`yara_from_bang.py`'s `ignore_ocaml`
/// skip).
pub fn extract_one(
    meta_ref: &MetaDirectoryRef,
    name: &str,
    info: &MetaInfo,
    config: &Config,
    denylist: &Denylist,
) -> Option<FileIdentifiers> {
    if config.ignore_ocaml && info.labels.contains("ocaml") {
        return None;
    }

    let (language, identifiers) = if info.labels.contains("elf") {
        ("elf", extract_elf(&info.metadata, config, denylist))
    } else if info.labels.contains("dex") {
        ("dex", extract_dex(&info.metadata, config, denylist))
    } else {
        return None;
    };

    if identifiers.is_empty() {
        return None;
    }

    Some(FileIdentifiers {
        meta_ref: meta_ref.clone(),
        name: name.to_string(),
        language,
        tlsh: metadata_string(&info.metadata, "tlsh"),
        telfhash: metadata_string(&info.metadata, "telfhash"),
        identifiers,
    })
}

/// Walks every MetaDirectory in `store` and extracts identifiers from
/// each `elf`/`dex`-labeled entry.
pub fn collect(
    store: &MetaDirectoryStore,
    config: &Config,
    denylist: &Denylist,
) -> crate::error::Result<Vec<FileIdentifiers>> {
    let mut out = Vec::new();
    for meta_ref in store.walk()? {
        let info = store.read_info(&meta_ref)?;
        let name = store.logical_name(&meta_ref).unwrap_or_else(|_| meta_ref.to_string());
        if let Some(fi) = extract_one(&meta_ref, &name, &info, config, denylist) {
            out.push(fi);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn ignore_ocaml_skips_ocaml_labeled_files() {
        let mut info = MetaInfo::default();
        info.labels.insert("elf".to_string());
        info.labels.insert("ocaml".to_string());
        info.metadata = json!({
            "symbols": [
                {"name": "caml_entry_point", "type": "func", "section_index": 1, "binding": "global"},
            ]
        })
        .as_object()
        .unwrap()
        .clone();

        let mut cfg = config();
        cfg.ignore_ocaml = true;
        let meta_ref = MetaDirectoryRef("deadbeef".to_string());
        assert!(extract_one(&meta_ref, "a.out", &info, &cfg, &Denylist::empty()).is_none());

        cfg.ignore_ocaml = false;
        assert!(extract_one(&meta_ref, "a.out", &info, &cfg, &Denylist::empty()).is_some());
    }

    #[test]
    fn elf_strips_version_suffix_and_skips_section_zero() {
        let metadata = json!({
            "strings": ["aaaaaaaa"],
            "symbols": [
                {"name": "foo@@GLIBC_2.2.5", "type": "func", "section_index": 7, "binding": "global"},
                {"name": "undef_sym", "type": "func", "section_index": 0, "binding": "global"},
            ]
        })
        .as_object()
        .unwrap()
        .clone();

        let out = extract_elf(&metadata, &config(), &Denylist::empty());
        assert_eq!(out.functions, BTreeSet::from(["foo".to_string()]));
        assert!(out.strings.contains("aaaaaaaa"));
    }

    #[test]
    fn elf_respects_identifier_cutoff_and_denylist() {
        let mut config = config();
        config.identifier_cutoff = 5;
        let metadata = json!({
            "strings": [],
            "symbols": [
                {"name": "abc", "type": "func", "section_index": 1, "binding": "global"},
                {"name": "allowed_name", "type": "object", "section_index": 1, "binding": "global"},
                {"name": "denied_name", "type": "object", "section_index": 1, "binding": "global"},
            ]
        })
        .as_object()
        .unwrap()
        .clone();
        let mut denylist = Denylist::empty();
        denylist.elf.variables.insert("denied_name".to_string());

        let out = extract_elf(&metadata, &config, &denylist);
        assert!(out.functions.is_empty()); // "abc" shorter than cutoff
        assert_eq!(out.variables, BTreeSet::from(["allowed_name".to_string()]));
    }

    #[test]
    fn elf_drops_weak_symbols_when_ignored() {
        let mut config = config();
        config.ignore_weak_symbols = true;
        let metadata = json!({
            "strings": [],
            "symbols": [
                {"name": "weak_fn", "type": "func", "section_index": 1, "binding": "weak"},
            ]
        })
        .as_object()
        .unwrap()
        .clone();
        let out = extract_elf(&metadata, &config, &Denylist::empty());
        assert!(out.functions.is_empty());
    }

    #[test]
    fn dex_skips_lifecycle_and_synthetic_methods() {
        let metadata = json!({
            "classes": [{
                "methods": [
                    {"name": "<init>", "strings": []},
                    {"name": "<clinit>", "strings": []},
                    {"name": "access$100", "strings": []},
                    {"name": "doWork", "strings": ["hello world!"]},
                ],
                "fields": [{"name": "mValue"}]
            }]
        })
        .as_object()
        .unwrap()
        .clone();

        let out = extract_dex(&metadata, &config(), &Denylist::empty());
        assert_eq!(out.functions, BTreeSet::from(["doWork".to_string()]));
        assert_eq!(out.variables, BTreeSet::from(["mValue".to_string()]));
        assert!(out.strings.contains("hello world!"));
    }

    #[test]
    fn extracted_gate_clears_small_groups() {
        let mut config = config();
        config.heuristics.functions.extracted = 5;
        let metadata = json!({
            "strings": [],
            "symbols": [
                {"name": "onlyone", "type": "func", "section_index": 1, "binding": "global"},
            ]
        })
        .as_object()
        .unwrap()
        .clone();
        let out = extract_elf(&metadata, &config, &Denylist::empty());
        assert!(out.functions.is_empty());
    }
}
