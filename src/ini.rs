//! Minimal ordered INI tokenizer (§4.E contract). No crate in the example
//! corpus provides an `ini`/`configparser`-equivalent parser, so this is
//! hand-rolled; see DESIGN.md for the justification.
//!
//! Honors the "unexpected value continuation" recovery: a malformed bundle
//! (a line that is neither a section header nor a `key = value` pair) is
//! retried once with every line's surrounding whitespace stripped, then
//! given up on.

use crate::error::SquashError;
use indexmap::IndexMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct IniSection {
    pub name: String,
    pub entries: IndexMap<String, String>,
}

pub struct IniDocument {
    pub sections: Vec<IniSection>,
}

impl IniDocument {
    pub fn sections_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a IniSection> + 'a {
        self.sections.iter().filter(move |s| s.name.starts_with(prefix))
    }
}

fn parse_strict(text: &str) -> Result<IniDocument, String> {
    let mut sections: Vec<IniSection> = Vec::new();
    let mut current: Option<IniSection> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(IniSection {
                name: trimmed[1..trimmed.len() - 1].to_string(),
                entries: IndexMap::new(),
            });
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            let section = current.as_mut().ok_or_else(|| "unexpected value continuation".to_string())?;
            section.entries.insert(key.trim().to_string(), value.trim().to_string());
            continue;
        }
        return Err("unexpected value continuation".to_string());
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }
    Ok(IniDocument { sections })
}

/// Parse an INI bundle's text, retrying once with every line stripped if the
/// first pass hits an unexpected value continuation.
pub fn parse(path: &Path, text: &str) -> Result<IniDocument, SquashError> {
    match parse_strict(text) {
        Ok(doc) => Ok(doc),
        Err(_) => {
            let recovered: String = text.lines().map(|l| l.trim()).collect::<Vec<_>>().join("\n");
            parse_strict(&recovered).map_err(|reason| SquashError::IniTokenize {
                path: path.to_path_buf(),
                reason,
            })
        }
    }
}

pub fn load(path: &Path) -> Result<IniDocument, SquashError> {
    let text = fs::read_to_string(path).map_err(SquashError::Io)?;
    parse(path, &text)
}

/// Read `config_version` from a `[vendor]`-style section, tolerating any
/// section name since PrusaSlicer bundles vary.
pub fn read_config_version(doc: &IniDocument) -> Option<String> {
    doc.sections.iter().find_map(|s| s.entries.get("config_version").cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_keys_in_order() {
        let text = "[vendor]\nconfig_version = 2.4.9\n\n[filament:Generic PLA]\ninherits = *PLA\ntemperature = 200\n";
        let doc = parse(Path::new("test.ini"), text).unwrap();
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[1].name, "filament:Generic PLA");
        assert_eq!(doc.sections[1].entries["temperature"], "200");
        assert_eq!(read_config_version(&doc), Some("2.4.9".to_string()));
    }

    #[test]
    fn recovers_from_whitespace_continuation() {
        let text = "[filament:Generic PLA]\n   temperature = 200   \n";
        let doc = parse(Path::new("test.ini"), text).unwrap();
        assert_eq!(doc.sections[0].entries["temperature"], "200");
    }

    #[test]
    fn stray_line_outside_any_section_is_an_error() {
        let text = "temperature = 200\n";
        assert!(parse(Path::new("test.ini"), text).is_err());
    }
}
