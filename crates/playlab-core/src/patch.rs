use crate::PlayError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Marker line opening the generated override block in a properties file.
/// Everything from this line onward is ours and is regenerated on each patch,
/// which is what makes re-patching idempotent.
const OVERRIDE_HEADER: &str = "# --- generated overrides, do not edit below ---";

/// Patches a `key=value` configuration template.
///
/// Lines whose key carries an override are kept for diagnosis but commented
/// out; the overrides themselves are appended in a marked trailing block.
/// Formats that treat later duplicate keys as authoritative therefore see the
/// override win. Applying the same overrides twice produces the same output
/// as applying them once.
pub fn patch_properties(template: &str, overrides: &BTreeMap<String, String>) -> String {
    // Drop any block generated by a previous application.
    let body = match template.find(OVERRIDE_HEADER) {
        Some(at) => &template[..at],
        None => template,
    };

    let mut out = String::with_capacity(body.len() + overrides.len() * 32);
    for line in body.lines() {
        let trimmed = line.trim_start();
        let key = trimmed
            .split_once('=')
            .map(|(key, _)| key.trim())
            .filter(|_| !trimmed.starts_with('#'));
        match key {
            Some(key) if overrides.contains_key(key) => {
                out.push('#');
                out.push_str(line);
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }

    out.push_str(OVERRIDE_HEADER);
    out.push('\n');
    for (key, value) in overrides {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Replaces the source of one notebook cell, addressed by position, with
/// literal declarations (typically the negotiated ports).
///
/// The notebook file owns the contract that the cell exists; a missing or
/// malformed cell is a `ConfigFormat` error, not something to paper over.
pub fn patch_notebook_cell(
    notebook_json: &str,
    cell_index: usize,
    source_lines: &[String],
) -> Result<String, PlayError> {
    let mut doc: Value = serde_json::from_str(notebook_json)
        .map_err(|e| PlayError::ConfigFormat(format!("notebook is not valid JSON: {e}")))?;

    let cells = doc
        .get_mut("cells")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| PlayError::ConfigFormat("notebook has no cells array".into()))?;

    let cell = cells.get_mut(cell_index).ok_or_else(|| {
        PlayError::ConfigFormat(format!("notebook has no cell at index {cell_index}"))
    })?;
    let cell = cell.as_object_mut().ok_or_else(|| {
        PlayError::ConfigFormat(format!("notebook cell {cell_index} is not an object"))
    })?;
    if !cell.contains_key("source") {
        return Err(PlayError::ConfigFormat(format!(
            "notebook cell {cell_index} has no source"
        )));
    }

    // ipynb convention: source is an array of strings, each line terminated
    // with a newline except the last.
    let last = source_lines.len().saturating_sub(1);
    let source: Vec<Value> = source_lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i < last {
                Value::String(format!("{line}\n"))
            } else {
                Value::String(line.clone())
            }
        })
        .collect();
    cell.insert("source".into(), Value::Array(source));

    serde_json::to_string_pretty(&doc)
        .map_err(|e| PlayError::ConfigFormat(format!("notebook re-serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn override_disables_original_line_and_appends_replacement() {
        let template = "http.bind.to=0.0.0.0:9000\npg.enabled=true\n";
        let patched = patch_properties(
            template,
            &overrides(&[("http.bind.to", "127.0.0.1:54321")]),
        );

        assert!(patched.contains("#http.bind.to=0.0.0.0:9000\n"));
        assert!(patched.contains("pg.enabled=true\n"));
        assert!(patched.ends_with("http.bind.to=127.0.0.1:54321\n"));
    }

    #[test]
    fn patching_twice_equals_patching_once() {
        let template = "http.bind.to=0.0.0.0:9000\n# a comment\nother=1\n";
        let ov = overrides(&[("http.bind.to", "127.0.0.1:54321"), ("other", "2")]);

        let once = patch_properties(template, &ov);
        let twice = patch_properties(&once, &ov);
        assert_eq!(once, twice);
    }

    #[test]
    fn untouched_lines_survive_verbatim() {
        let template = "# leading comment\n\nkeep.me=as-is\n";
        let patched = patch_properties(template, &overrides(&[("absent.key", "x")]));
        assert!(patched.starts_with("# leading comment\n\nkeep.me=as-is\n"));
        assert!(patched.contains("absent.key=x\n"));
    }

    #[test]
    fn empty_template_still_gets_override_block() {
        let patched = patch_properties("", &overrides(&[("http.bind.to", "127.0.0.1:1")]));
        assert!(patched.starts_with(OVERRIDE_HEADER));
        assert!(patched.contains("http.bind.to=127.0.0.1:1\n"));
    }

    const NOTEBOOK: &str = r##"{
        "cells": [
            {"cell_type": "markdown", "source": ["# intro"]},
            {"cell_type": "code", "source": ["http_port = 9000"], "outputs": []}
        ],
        "nbformat": 4
    }"##;

    #[test]
    fn replaces_only_the_indexed_cell() {
        let lines = vec!["http_port = 41234".to_string(), "sql_port = 41235".to_string()];
        let patched = patch_notebook_cell(NOTEBOOK, 1, &lines).unwrap();

        let doc: Value = serde_json::from_str(&patched).unwrap();
        let cells = doc["cells"].as_array().unwrap();
        assert_eq!(cells[0]["source"][0], "# intro");
        assert_eq!(cells[1]["source"][0], "http_port = 41234\n");
        assert_eq!(cells[1]["source"][1], "sql_port = 41235");
        // The rest of the cell survives.
        assert!(cells[1]["outputs"].is_array());
    }

    #[test]
    fn missing_cell_is_a_config_format_error() {
        let err = patch_notebook_cell(NOTEBOOK, 7, &["x = 1".to_string()]).unwrap_err();
        assert!(matches!(err, PlayError::ConfigFormat(_)));
    }

    #[test]
    fn document_without_cells_is_rejected() {
        let err = patch_notebook_cell(r#"{"nbformat": 4}"#, 0, &[]).unwrap_err();
        assert!(matches!(err, PlayError::ConfigFormat(_)));
    }
}
