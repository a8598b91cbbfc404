//! Textual scan-rule emission from extracted identifiers.
//!
//! Grounded line-for-line on `yara_from_bang.py`'s `generate_yara` (per-
//! file rule) and `yara_from_source.py`'s aggregate union/intersection
//! pass (`all_*_union`/`all_*_intersection`, the `min_across_versions /
//! union_size` percentage scaling). Per spec.md §9's Open Question, the
//! condition block is emitted consistently per group (`N of
//! ($string*)`/`($function*)`/`($variable*)`) — the source's divergent
//! `of ($string*)` leaking into the function/variable branches in one of
//! its two implementations is not reproduced.

use std::fs;
use std::io;
use std::path::Path;

use crate::config::{Config, ConditionOperator, GroupHeuristics, Heuristics};
use crate::identifier::FileIdentifiers;

/// `str.translate(NAME_ESCAPE)` from the source: a generated rule
/// identifier must be a valid YARA symbol, so `.` and `-` become `_`.
fn escape_rule_name(s: &str) -> String {
    s.chars()
        .map(|c| if c == '.' || c == '-' { '_' } else { c })
        .collect()
}

/// One emitted rule: its destination file name (spec.md §6:
/// `<name>-<sha256>.<ext>`) and its full textual body.
#[derive(Debug, Clone)]
pub struct Rule {
    pub file_name: String,
    pub body: String,
}

impl Rule {
    pub fn write_to(&self, directory: &Path) -> io::Result<()> {
        fs::create_dir_all(directory)?;
        fs::write(directory.join(&self.file_name), &self.body)
    }
}

/// Writes one group's `strings:` block entries (`$string7 = "..."`,
/// optionally `fullword`), returns the running counter for the next
/// group.
fn write_group(body: &mut String, prefix: &str, comment: &str, items: &[String], fullword: bool, mut counter: usize) -> usize {
    if items.is_empty() {
        return counter;
    }
    body.push_str(&format!("\n        // {comment}\n\n"));
    for item in items {
        if fullword {
            body.push_str(&format!("        ${prefix}{counter} = \"{item}\" fullword\n"));
        } else {
            body.push_str(&format!("        ${prefix}{counter} = \"{item}\"\n"));
        }
        counter += 1;
    }
    counter
}

/// Appends one group's condition clause (`N of ($group*)` or `any of
/// ($group*)`), followed by the operator keyword if another populated
/// group follows.
fn write_condition_clause(
    body: &mut String,
    prefix: &str,
    count: usize,
    heuristics: &GroupHeuristics,
    operator: ConditionOperator,
    more_follow: bool,
) {
    if count == 0 {
        return;
    }
    match heuristics.threshold(count) {
        Some(n) => body.push_str(&format!("        {n} of (${prefix}*)")),
        None => body.push_str(&format!("        any of (${prefix}*)")),
    }
    if more_follow {
        body.push_str(&format!(" {}\n", operator.as_yara_keyword()));
    } else {
        body.push('\n');
    }
}

/// Flat per-file rule metadata, written into the `meta` block.
#[derive(Debug, Clone, Default)]
pub struct RuleMeta {
    pub name: String,
    pub sha256: String,
    pub package: Option<String>,
    pub tlsh: Option<String>,
    pub telfhash: Option<String>,
}

/// Builds a rule body for a fixed set of identifier groups, metadata, and
/// tags, honoring the configured heuristics/operator/fullword. `rule_id`
/// is the caller-supplied UUID (main.rs uses a real one; tests pass a
/// fixed string so output is deterministic).
fn build_rule_body(
    meta: &RuleMeta,
    strings: &[String],
    functions: &[String],
    variables: &[String],
    tags: &[&str],
    heuristics: &Heuristics,
    operator: ConditionOperator,
    fullword: bool,
    rule_id: &str,
    generated_at: &str,
) -> String {
    let mut body = String::new();
    let rule_name = format!("rule_{}", escape_rule_name(rule_id));
    if tags.is_empty() {
        body.push_str(&format!("rule {rule_name}\n"));
    } else {
        body.push_str(&format!("rule {rule_name}: {}\n", tags.join(" ")));
    }
    body.push_str("{\n    meta:\n");
    body.push_str(&format!("        description = \"Rule for {}\"\n", meta.name));
    body.push_str("        author = \"Generated by triagekit\"\n");
    body.push_str(&format!("        date = \"{generated_at}\"\n"));
    body.push_str(&format!("        uuid = \"{rule_id}\"\n"));
    body.push_str(&format!("        name = \"{}\"\n", meta.name));
    body.push_str(&format!("        sha256 = \"{}\"\n", meta.sha256));
    if let Some(package) = &meta.package {
        body.push_str(&format!("        package = \"{package}\"\n"));
    }
    if let Some(tlsh) = &meta.tlsh {
        body.push_str(&format!("        tlsh = \"{tlsh}\"\n"));
    }
    if let Some(telfhash) = &meta.telfhash {
        body.push_str(&format!("        telfhash = \"{telfhash}\"\n"));
    }

    body.push_str("\n    strings:\n");
    write_group(&mut body, "string", "Extracted strings", strings, fullword, 1);
    write_group(&mut body, "function", "Extracted functions", functions, fullword, 1);
    write_group(&mut body, "variable", "Extracted variables", variables, fullword, 1);

    body.push_str("\n    condition:\n");
    let groups: [(&str, usize, &GroupHeuristics); 3] = [
        ("string", strings.len(), &heuristics.strings),
        ("function", functions.len(), &heuristics.functions),
        ("variable", variables.len(), &heuristics.variables),
    ];
    for (i, (prefix, count, group_heuristics)) in groups.iter().enumerate() {
        if *count == 0 {
            continue;
        }
        let more_follow = groups[i + 1..].iter().any(|(_, c, _)| *c > 0);
        write_condition_clause(&mut body, prefix, *count, group_heuristics, operator, more_follow);
    }
    body.push_str("}\n");
    body
}

/// Emits the per-file rule for one extracted-identifiers record, or
/// `None` if every group is empty (spec.md: "an empty identifier set
/// suppresses rule emission").
#[allow(clippy::too_many_arguments)]
pub fn emit_file_rule(
    file: &FileIdentifiers,
    package: Option<&str>,
    sha256: &str,
    config: &Config,
    rule_id: &str,
    generated_at: &str,
) -> Option<Rule> {
    if file.identifiers.is_empty() {
        return None;
    }
    let meta = RuleMeta {
        name: file.name.clone(),
        sha256: sha256.to_string(),
        package: package.map(str::to_string),
        tlsh: file.tlsh.clone(),
        telfhash: file.telfhash.clone(),
    };
    let strings: Vec<String> = file.identifiers.strings.iter().cloned().collect();
    let functions: Vec<String> = file.identifiers.functions.iter().cloned().collect();
    let variables: Vec<String> = file.identifiers.variables.iter().cloned().collect();
    let tags = [file.language];

    let body = build_rule_body(
        &meta,
        &strings,
        &functions,
        &variables,
        &tags,
        &config.heuristics,
        config.operator,
        config.fullword,
        rule_id,
        generated_at,
    );
    Some(Rule {
        file_name: format!("{}-{}.yara", file.name, sha256),
        body,
    })
}

/// Union and intersection aggregate rules across every processed version
/// of one package, grounded on `yara_from_source.py`'s cross-version
/// pass. `versions` must be non-empty.
pub fn emit_aggregate_rules(
    package: &str,
    language: &str,
    versions: &[FileIdentifiers],
    config: &Config,
    rule_id_union: &str,
    rule_id_intersection: &str,
    generated_at: &str,
) -> Option<(Rule, Rule)> {
    let first = versions.first()?;

    let mut union = first.identifiers.clone();
    let mut intersection = first.identifiers.clone();
    for v in &versions[1..] {
        union.strings.extend(v.identifiers.strings.iter().cloned());
        union.functions.extend(v.identifiers.functions.iter().cloned());
        union.variables.extend(v.identifiers.variables.iter().cloned());
        intersection.strings = intersection
            .strings
            .intersection(&v.identifiers.strings)
            .cloned()
            .collect();
        intersection.functions = intersection
            .functions
            .intersection(&v.identifiers.functions)
            .cloned()
            .collect();
        intersection.variables = intersection
            .variables
            .intersection(&v.identifiers.variables)
            .cloned()
            .collect();
    }
    if union.is_empty() {
        return None;
    }

    // min_across_versions / union_size scaling, per yara_from_source.py:
    // heuristics['*_percentage'] = min(percentage, percentage *
    // min_across_versions / union_size) — loosens the threshold so a
    // short version isn't held to an impossible match count.
    let scaled = |min_count: usize, union_count: usize, base: &GroupHeuristics| -> GroupHeuristics {
        if union_count == 0 {
            return *base;
        }
        let scale = (min_count as f64 / union_count as f64).min(1.0);
        GroupHeuristics {
            percentage: std::cmp::max(1, (base.percentage as f64 / scale.max(f64::EPSILON)) as usize),
            ..*base
        }
    };
    let min_strings = versions.iter().map(|v| v.identifiers.strings.len()).min().unwrap_or(0);
    let min_functions = versions.iter().map(|v| v.identifiers.functions.len()).min().unwrap_or(0);
    let min_variables = versions.iter().map(|v| v.identifiers.variables.len()).min().unwrap_or(0);

    let mut union_heuristics = config.heuristics.clone();
    union_heuristics.strings = scaled(min_strings, union.strings.len(), &config.heuristics.strings);
    union_heuristics.functions = scaled(min_functions, union.functions.len(), &config.heuristics.functions);
    union_heuristics.variables = scaled(min_variables, union.variables.len(), &config.heuristics.variables);

    let union_meta = RuleMeta {
        name: format!("{package}-union"),
        sha256: String::new(),
        package: Some(package.to_string()),
        tlsh: None,
        telfhash: None,
    };
    let intersection_meta = RuleMeta {
        name: format!("{package}-intersection"),
        sha256: String::new(),
        package: Some(package.to_string()),
        tlsh: None,
        telfhash: None,
    };
    let tags = [language];

    let union_body = build_rule_body(
        &union_meta,
        &union.strings.iter().cloned().collect::<Vec<_>>(),
        &union.functions.iter().cloned().collect::<Vec<_>>(),
        &union.variables.iter().cloned().collect::<Vec<_>>(),
        &tags,
        &union_heuristics,
        config.operator,
        config.fullword,
        rule_id_union,
        generated_at,
    );
    let intersection_body = build_rule_body(
        &intersection_meta,
        &intersection.strings.iter().cloned().collect::<Vec<_>>(),
        &intersection.functions.iter().cloned().collect::<Vec<_>>(),
        &intersection.variables.iter().cloned().collect::<Vec<_>>(),
        &tags,
        &config.heuristics,
        config.operator,
        config.fullword,
        rule_id_intersection,
        generated_at,
    );

    Some((
        Rule {
            file_name: format!("{package}-union-{rule_id_union}.yara"),
            body: union_body,
        },
        Rule {
            file_name: format!("{package}-intersection-{rule_id_intersection}.yara"),
            body: intersection_body,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::ExtractedIdentifiers;
    use crate::meta_directory::MetaDirectoryRef;
    use std::collections::BTreeSet;

    fn file(name: &str, strings: &[&str], functions: &[&str]) -> FileIdentifiers {
        FileIdentifiers {
            meta_ref: MetaDirectoryRef(format!("ref-{name}")),
            name: name.to_string(),
            language: "elf",
            tlsh: None,
            telfhash: None,
            identifiers: ExtractedIdentifiers {
                strings: strings.iter().map(|s| s.to_string()).collect(),
                functions: functions.iter().map(|s| s.to_string()).collect(),
                variables: BTreeSet::new(),
            },
        }
    }

    #[test]
    fn empty_identifiers_suppress_rule_emission() {
        let f = file("empty", &[], &[]);
        let config = Config::default();
        let rule = emit_file_rule(&f, None, "abc123", &config, "fixed-uuid", "2026-07-28T00:00:00Z");
        assert!(rule.is_none());
    }

    #[test]
    fn file_rule_has_spec_filename_grammar() {
        let f = file("libfoo.so", &["aaaaaaaa"], &["foo_func"]);
        let config = Config::default();
        let rule = emit_file_rule(&f, Some("pkg"), "deadbeef", &config, "fixed-uuid", "2026-07-28T00:00:00Z").unwrap();
        assert_eq!(rule.file_name, "libfoo.so-deadbeef.yara");
        assert!(rule.body.contains("$string1 = \"aaaaaaaa\""));
        assert!(rule.body.contains("$function1 = \"foo_func\""));
        assert!(rule.body.contains("and\n"));
    }

    #[test]
    fn condition_uses_any_below_minimum_present() {
        let f = file("small", &["onestring"], &[]);
        let mut config = Config::default();
        config.heuristics.strings.minimum_present = 100;
        let rule = emit_file_rule(&f, None, "hash", &config, "id", "now").unwrap();
        assert!(rule.body.contains("any of ($string*)"));
    }

    #[test]
    fn or_operator_is_honored() {
        let f = file("orred", &["abcdefgh"], &["some_fn"]);
        let mut config = Config::default();
        config.operator = ConditionOperator::Or;
        let rule = emit_file_rule(&f, None, "hash", &config, "id", "now").unwrap();
        assert!(rule.body.contains(" or\n"));
        assert!(!rule.body.contains(" and\n"));
    }

    #[test]
    fn aggregate_union_contains_every_version_identifier() {
        let v1 = file("pkg-1.0", &["alpha_string"], &["fn_one"]);
        let v2 = file("pkg-2.0", &["beta_string"], &["fn_two"]);
        let config = Config::default();
        let (union, intersection) =
            emit_aggregate_rules("pkg", "elf", &[v1, v2], &config, "u", "i", "now").unwrap();
        assert!(union.body.contains("alpha_string"));
        assert!(union.body.contains("beta_string"));
        assert!(!intersection.body.contains("alpha_string"));
    }
}
