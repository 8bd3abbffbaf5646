//! Annotation-hint parsing for autodiscovered workloads.
//!
//! Collectors are tuned through workload annotations of the form
//! `<prefix>.<section>/<leaf>` (for example
//! `co.elastic.logs/multiline.pattern`). This module turns a nested
//! annotation map into a flat hint tree, validates hint names against a
//! supported vocabulary, and offers typed accessors over the resulting
//! tree.
//!
//! Precedence is deterministic: pod-level hints are inserted first and are
//! never overwritten; container-scoped hints (`<container>/<leaf>` keys
//! nested beneath a section) only fill gaps.

use serde_json::Value;

use crate::mapping::{self, Mapping};

/// Parse annotations under `prefix` into a hint tree.
///
/// Returns the tree and the list of annotation keys (relative to the
/// prefix) whose hint name is not part of the supported vocabulary.
/// Unsupported hints still land in the tree; validation only reports them.
///
/// Substream enumerations extend the vocabulary before validation:
/// `hints/data_streams` and `metrics/metricsets` comma lists allow-list
/// each named substream, and numeric enumerations (`metrics/1.module`)
/// allow-list the numeric token. Leaves beneath an enumerated entry are
/// validated against the extended vocabulary.
pub fn generate_hints(
    annotations: &Mapping,
    container: &str,
    prefix: &str,
    supported: &[&str],
) -> (Mapping, Vec<String>) {
    let mut hints = Mapping::new();
    let mut unsupported = Vec::new();

    let entries = match mapping::get(annotations, prefix) {
        Some(Value::Object(entries)) => entries,
        _ => return (hints, unsupported),
    };

    let mut vocabulary: Vec<String> = supported.iter().map(|s| s.to_string()).collect();

    for stream in get_hint_as_list(entries, "hints/data_streams", "") {
        vocabulary.push(stream.clone());
        check_enumerated_set(
            annotations,
            prefix,
            "hints",
            &stream,
            &vocabulary,
            &mut unsupported,
        );
    }
    for metricset in get_hint_as_list(entries, "metrics/metricsets", "") {
        vocabulary.push(metricset.clone());
        check_enumerated_set(
            annotations,
            prefix,
            "metrics",
            &metricset,
            &vocabulary,
            &mut unsupported,
        );
    }

    // Pod-level hints: `<section>/<leaf>` keys directly under the prefix.
    for (key, raw_value) in entries {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() != 2 {
            continue;
        }
        validate_leaf(key, parts[1], raw_value, &mut vocabulary, &mut unsupported);

        let hint_key = format!("{}.{}", parts[0], parts[1]);
        if mapping::get(&hints, &hint_key).is_none() {
            mapping::put(&mut hints, &hint_key, raw_value.clone());
        }
    }

    // Container-level hints fill remaining gaps.
    if !container.is_empty() {
        let container_prefix = format!("{container}/");
        for (section, raw_value) in entries {
            if section.contains('/') {
                continue;
            }
            let section_hints = match raw_value.as_object() {
                Some(m) => m,
                None => continue,
            };
            for (hint_key, raw_val) in section_hints {
                if !hint_key.starts_with(&container_prefix) {
                    continue;
                }
                let parts: Vec<&str> = hint_key.split('/').collect();
                if parts.len() != 2 {
                    continue;
                }
                let annotation_key = format!("{section}.{hint_key}");
                validate_leaf(
                    &annotation_key,
                    parts[1],
                    raw_val,
                    &mut vocabulary,
                    &mut unsupported,
                );

                let target = format!("{section}.{}", parts[1]);
                if mapping::get(&hints, &target).is_none() {
                    mapping::put(&mut hints, &target, raw_val.clone());
                }
            }
        }
    }

    (hints, unsupported)
}

/// Validate one hint leaf against the vocabulary, extending it first when
/// the leaf is a numeric enumeration token.
fn validate_leaf(
    annotation_key: &str,
    leaf: &str,
    value: &Value,
    vocabulary: &mut Vec<String>,
    unsupported: &mut Vec<String>,
) {
    if !leaf.is_empty() && leaf.bytes().all(|b| b.is_ascii_digit()) {
        vocabulary.push(leaf.to_string());
        if let Some(enumerated) = value.as_object() {
            for sub in enumerated.keys() {
                if !vocabulary.iter().any(|v| v == sub) {
                    unsupported.push(format!("{annotation_key}.{sub}"));
                }
            }
        }
    }
    if !vocabulary.iter().any(|v| v == leaf) {
        unsupported.push(annotation_key.to_string());
    }
}

/// Validate every leaf declared beneath an enumerated substream
/// (`<prefix>.<section>/<name>`), recording violations as
/// `<section>/<name>.<leaf>`.
fn check_enumerated_set(
    annotations: &Mapping,
    prefix: &str,
    section: &str,
    name: &str,
    vocabulary: &[String],
    unsupported: &mut Vec<String>,
) {
    let path = format!("{prefix}.{section}/{name}");
    if let Some(Value::Object(entries)) = mapping::get(annotations, &path) {
        for hint_key in entries.keys() {
            if !vocabulary.iter().any(|v| v == hint_key) {
                unsupported.push(format!("{section}/{name}.{hint_key}"));
            }
        }
    }
}

/// Fetch a hint as a string. The lookup path is `<key>.<config>`, or
/// `<key>` alone when `config` is empty.
pub fn get_hint_string(hints: &Mapping, key: &str, config: &str) -> Option<String> {
    let base = hint_path(key, config);
    match mapping::get(hints, &base) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Fetch a hint as a nested mapping.
pub fn get_hint_map<'a>(hints: &'a Mapping, key: &str, config: &str) -> Option<&'a Mapping> {
    let base = hint_path(key, config);
    mapping::get(hints, &base).and_then(Value::as_object)
}

/// Fetch a hint and split it as a comma list with whitespace trimming.
pub fn get_hint_as_list(hints: &Mapping, key: &str, config: &str) -> Vec<String> {
    match get_hint_string(hints, key, config) {
        Some(s) if !s.is_empty() => string_as_list(&s),
        _ => Vec::new(),
    }
}

fn hint_path(key: &str, config: &str) -> String {
    if config.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        config.to_string()
    } else {
        format!("{key}.{config}")
    }
}

fn string_as_list(input: &str) -> Vec<String> {
    if input.is_empty() {
        return Vec::new();
    }
    input.split(',').map(|s| s.trim().to_string()).collect()
}

/// True only when the `enabled` hint under `key` is explicitly `true`.
pub fn is_enabled(hints: &Mapping, key: &str) -> bool {
    match get_hint_string(hints, key, "enabled") {
        Some(value) => value.parse::<bool>().unwrap_or(false),
        None => false,
    }
}

/// True only when the `enabled` hint under `key` is explicitly `false`.
pub fn is_disabled(hints: &Mapping, key: &str) -> bool {
    match get_hint_string(hints, key, "enabled") {
        Some(value) => match value.parse::<bool>() {
            Ok(enabled) => !enabled,
            Err(err) => {
                tracing::debug!(error = %err, hint = %key, "unparseable 'enabled' hint");
                false
            }
        },
        None => false,
    }
}

/// Parse the `<key>.raw` hint, a stringified JSON object or array of
/// objects, into a list of mappings. Malformed JSON yields nothing.
pub fn get_hint_as_configs(hints: &Mapping, key: &str) -> Vec<Mapping> {
    let raw = match get_hint_string(hints, key, "raw") {
        Some(s) if !s.is_empty() => s,
        _ => return Vec::new(),
    };

    if !raw.starts_with('[') {
        return match serde_json::from_str::<Mapping>(&raw) {
            Ok(cfg) => vec![cfg],
            Err(err) => {
                tracing::debug!(error = %err, hint = %key, "unable to parse raw hint as JSON");
                Vec::new()
            }
        };
    }

    match serde_json::from_str::<Vec<Mapping>>(&raw) {
        Ok(cfgs) => cfgs,
        Err(err) => {
            tracing::debug!(error = %err, hint = %key, "unable to parse raw hint as JSON");
            Vec::new()
        }
    }
}

/// Collect the sub-maps under `<key>.<name>` as a config list: entries
/// with all-digit keys first in ascending numeric order, then each
/// remaining key as its own single-entry map.
pub fn get_configs(hints: &Mapping, key: &str, name: &str) -> Vec<Mapping> {
    let raw = match get_hint_map(hints, key, name) {
        Some(m) => m,
        None => return Vec::new(),
    };

    let (nums, words) = split_numeric_keys(raw);

    let mut configs = Vec::new();
    for num in nums {
        if let Some(Value::Object(cfg)) = raw.get(&num) {
            configs.push(cfg.clone());
        }
    }
    for word in words {
        let mut cfg = Mapping::new();
        cfg.insert(word.clone(), raw[&word].clone());
        configs.push(cfg);
    }
    configs
}

/// Collect the hints under `key` as a config list: numeric entries in
/// ascending order followed by one map of all non-numeric entries.
pub fn get_hints_as_list(hints: &Mapping, key: &str) -> Vec<Mapping> {
    let raw = match get_hint_map(hints, key, "") {
        Some(m) => m,
        None => return Vec::new(),
    };

    let (nums, words) = split_numeric_keys(raw);

    let mut configs = Vec::new();
    for num in nums {
        if let Some(Value::Object(cfg)) = raw.get(&num) {
            configs.push(cfg.clone());
        }
    }

    let mut defaults = Mapping::new();
    for word in words {
        defaults.insert(word.clone(), raw[&word].clone());
    }
    if !defaults.is_empty() {
        configs.push(defaults);
    }
    configs
}

/// Processor definitions from the hints: `get_configs(.., "processors")`
/// with stringified-JSON values parsed into objects. A processor whose
/// value fails to parse is logged and skipped.
pub fn get_processors(hints: &Mapping, key: &str) -> Vec<Mapping> {
    let mut processors = Vec::new();
    'next: for proc in get_configs(hints, key, "processors") {
        let mut parsed = Mapping::new();
        for (name, value) in &proc {
            match value {
                Value::String(raw) => match serde_json::from_str::<Mapping>(raw) {
                    Ok(cfg) => {
                        parsed.insert(name.clone(), Value::Object(cfg));
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, processor = %name, "unable to parse processor hint as JSON");
                        continue 'next;
                    }
                },
                other => {
                    parsed.insert(name.clone(), other.clone());
                }
            }
        }
        processors.push(parsed);
    }
    processors
}

fn split_numeric_keys(raw: &Mapping) -> (Vec<String>, Vec<String>) {
    let mut nums: Vec<(u64, String)> = Vec::new();
    let mut words = Vec::new();
    for key in raw.keys() {
        match key.parse::<u64>() {
            Ok(n) => nums.push((n, key.clone())),
            Err(_) => words.push(key.clone()),
        }
    }
    nums.sort_by_key(|(n, _)| *n);
    (nums.into_iter().map(|(_, k)| k).collect(), words)
}
