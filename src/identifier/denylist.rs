//! Optional low-quality identifier denylist: `{elf: {functions, variables,
//! strings}, dex: {functions, variables, strings}}`, per spec.md §4.6/§6.
//!
//! `yara_from_bang.py`'s `main()` loads this from a pickle
//! (`lq_identifiers`); a pickle has no idiomatic Rust analogue, so this
//! loads the same shape from JSON via `serde_json`, already the teacher's
//! (and this crate's) format for every other structured document.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TriageError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageDenylist {
    #[serde(default)]
    pub functions: BTreeSet<String>,
    #[serde(default)]
    pub variables: BTreeSet<String>,
    #[serde(default)]
    pub strings: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Denylist {
    #[serde(default)]
    pub elf: LanguageDenylist,
    #[serde(default)]
    pub dex: LanguageDenylist,
}

impl Denylist {
    /// An empty denylist: every identifier passes. Used when no
    /// `--identifiers` document is supplied.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| TriageError::io(e, path.to_path_buf()))?;
        serde_json::from_slice(&data).map_err(TriageError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_denylist_parses_from_minimal_json() {
        let d: Denylist = serde_json::from_str("{}").unwrap();
        assert!(d.elf.functions.is_empty());
        assert!(d.dex.strings.is_empty());
    }

    #[test]
    fn denylist_round_trips() {
        let mut d = Denylist::empty();
        d.elf.functions.insert("malloc".to_string());
        let json = serde_json::to_string(&d).unwrap();
        let back: Denylist = serde_json::from_str(&json).unwrap();
        assert!(back.elf.functions.contains("malloc"));
    }
}
