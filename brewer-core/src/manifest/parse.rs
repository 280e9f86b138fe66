//! The header-based (preferred) manifest dialect.
//!
//! Paragraphs separated by blank lines; `Key: value` lines with indented
//! continuation lines; full-line `#` comments stripped before parsing.
//! The first paragraph is the global default entry.

use crate::error::{BrewError, Result};
use crate::manifest::{default_entry, Manifest, ManifestEntry};

/// Keys that may be overridden per architecture (`<arch>-<Key>`).
const ARCH_KEYS: &[&str] = &[
    "GitRepo",
    "GitFetch",
    "GitCommit",
    "Directory",
    "File",
    "Builder",
    "Constraints",
];

struct Field {
    line: usize,
    key: String,
    value: String,
}

pub fn parse_rfc2822(input: &str) -> Result<Manifest> {
    let paragraphs = split_paragraphs(input)?;

    let mut paragraphs = paragraphs.into_iter();
    let global_fields = match paragraphs.next() {
        Some(fields) => fields,
        None => {
            return Err(BrewError::ManifestParse {
                line: 0,
                text: String::new(),
                reason: "empty manifest".to_string(),
            })
        }
    };

    let global = entry_from_fields(&global_fields, true)?;
    global.check_maintainers()?;
    let global = global.defaults_from(&default_entry());

    let mut manifest = Manifest {
        global,
        entries: Vec::new(),
    };

    for fields in paragraphs {
        let first_line = fields.first().map(|field| field.line).unwrap_or(0);
        let entry = entry_from_fields(&fields, false)?;
        entry.check_maintainers()?;
        let entry = entry.defaults_from(&manifest.global);
        if entry.tags.is_empty() {
            return Err(BrewError::ManifestParse {
                line: first_line,
                text: String::new(),
                reason: "entry paragraph missing Tags".to_string(),
            });
        }
        manifest.add_entry(entry)?;
    }

    Ok(manifest)
}

/// Split into paragraphs of folded `Key: value` fields, stripping comments
/// and normalizing line endings.
fn split_paragraphs(input: &str) -> Result<Vec<Vec<Field>>> {
    let mut paragraphs: Vec<Vec<Field>> = Vec::new();
    let mut current: Vec<Field> = Vec::new();

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r');

        if line.trim_start().starts_with('#') {
            continue;
        }
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // continuation of the previous field's value
            match current.last_mut() {
                Some(field) => {
                    if !field.value.is_empty() {
                        field.value.push(' ');
                    }
                    field.value.push_str(line.trim());
                }
                None => {
                    return Err(BrewError::ManifestParse {
                        line: line_no,
                        text: line.to_string(),
                        reason: "continuation line with no field to continue".to_string(),
                    })
                }
            }
            continue;
        }

        let (key, value) = line.split_once(':').ok_or_else(|| BrewError::ManifestParse {
            line: line_no,
            text: line.to_string(),
            reason: "expected \"Key: value\"".to_string(),
        })?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(BrewError::ManifestParse {
                line: line_no,
                text: line.to_string(),
                reason: format!("invalid key {:?}", key),
            });
        }
        current.push(Field {
            line: line_no,
            key: key.to_string(),
            value: value.trim().to_string(),
        });
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs)
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn entry_from_fields(fields: &[Field], global: bool) -> Result<ManifestEntry> {
    let mut entry = ManifestEntry::default();

    for field in fields {
        let already_set = match field.key.as_str() {
            "Maintainers" => {
                let set = !entry.maintainers.is_empty();
                entry.maintainers = comma_list(&field.value);
                set
            }
            "Tags" => {
                if global {
                    return Err(BrewError::ManifestParse {
                        line: field.line,
                        text: field.value.clone(),
                        reason: "the global entry must not declare Tags".to_string(),
                    });
                }
                let set = !entry.tags.is_empty();
                entry.tags = comma_list(&field.value);
                set
            }
            "SharedTags" => {
                let set = !entry.shared_tags.is_empty();
                entry.shared_tags = comma_list(&field.value);
                set
            }
            "Architectures" => entry
                .architectures
                .replace(comma_list(&field.value))
                .is_some(),
            "GitRepo" => entry.git_repo.replace(field.value.clone()).is_some(),
            "GitFetch" => entry.git_fetch.replace(field.value.clone()).is_some(),
            "GitCommit" => entry.git_commit.replace(field.value.clone()).is_some(),
            "Directory" => entry.directory.replace(field.value.clone()).is_some(),
            "File" => entry.file.replace(field.value.clone()).is_some(),
            "Builder" => entry.builder.replace(field.value.clone()).is_some(),
            "Constraints" => {
                let set = !entry.constraints.is_empty();
                entry.constraints = comma_list(&field.value);
                set
            }
            other => match split_arch_key(other) {
                Some((arch, key)) => {
                    let map = match key {
                        "GitRepo" => &mut entry.arch_git_repo,
                        "GitFetch" => &mut entry.arch_git_fetch,
                        "GitCommit" => &mut entry.arch_git_commit,
                        "Directory" => &mut entry.arch_directory,
                        "File" => &mut entry.arch_file,
                        "Builder" => &mut entry.arch_builder,
                        "Constraints" => {
                            let set = entry
                                .arch_constraints
                                .insert(arch.to_string(), comma_list(&field.value))
                                .is_some();
                            if set {
                                return Err(duplicate_key(field));
                            }
                            continue;
                        }
                        _ => unreachable!("split_arch_key only returns ARCH_KEYS"),
                    };
                    map.insert(arch.to_string(), field.value.clone()).is_some()
                }
                None => {
                    return Err(BrewError::ManifestParse {
                        line: field.line,
                        text: field.key.clone(),
                        reason: "unknown key".to_string(),
                    })
                }
            },
        };
        if already_set {
            return Err(duplicate_key(field));
        }
    }

    Ok(entry)
}

fn duplicate_key(field: &Field) -> BrewError {
    BrewError::ManifestParse {
        line: field.line,
        text: field.key.clone(),
        reason: "duplicate key in paragraph".to_string(),
    }
}

/// `arm64v8-GitCommit` -> `("arm64v8", "GitCommit")`, for supported
/// architectures and overridable keys only.
fn split_arch_key(key: &str) -> Option<(&str, &str)> {
    for arch_key in ARCH_KEYS {
        if let Some(prefix) = key.strip_suffix(arch_key) {
            let arch = prefix.strip_suffix('-')?;
            if crate::arch::is_supported(arch) {
                return Some((arch, arch_key));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let input = "# leading comment\nGitRepo: https://example.com/x.git\n\n   # indented comment\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\n";
        let manifest = parse_rfc2822(input).unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].tags, vec!["a"]);
    }

    #[test]
    fn folded_values_are_joined() {
        let input = "Maintainers: One <one@example.com> (@one),\n    Two <two@example.com> (@two)\nGitRepo: https://example.com/x.git\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\n";
        let manifest = parse_rfc2822(input).unwrap();
        assert_eq!(manifest.global.maintainers.len(), 2);
        assert_eq!(manifest.global.maintainers[1], "Two <two@example.com> (@two)");
    }

    #[test]
    fn unknown_keys_fail() {
        let input = "GitRepo: https://example.com/x.git\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\nFrobnicate: yes\n";
        let err = parse_rfc2822(input).unwrap_err();
        assert!(matches!(err, BrewError::ManifestParse { ref reason, .. } if reason == "unknown key"), "{err}");
    }

    #[test]
    fn unknown_arch_prefix_fails() {
        let input = "GitRepo: https://example.com/x.git\n\nTags: a\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\nvax-GitCommit: d7e2a8d90a9b8f5dfd5bcd428e0c33b68c40cc19\n";
        assert!(parse_rfc2822(input).is_err());
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let input = "GitRepo: https://example.com/x.git\n\nTags: a\nno colon here\n";
        match parse_rfc2822(input).unwrap_err() {
            BrewError::ManifestParse { line, text, .. } => {
                assert_eq!(line, 4);
                assert_eq!(text, "no colon here");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn global_may_not_declare_tags() {
        let input = "Tags: a\nGitRepo: https://example.com/x.git\nGitCommit: 0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\n";
        assert!(parse_rfc2822(input).is_err());
    }
}
