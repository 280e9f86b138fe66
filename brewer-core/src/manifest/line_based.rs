//! The legacy line-based manifest dialect.
//!
//! One tag per non-blank non-comment line:
//! `TAG: GIT_REPO @ GIT_COMMIT[ DIRECTORY]`

use crate::error::{BrewError, Result};
use crate::manifest::{default_entry, Manifest, ManifestEntry, DEFAULT_LINE_BASED_FETCH};

fn parse_line(line: &str, line_no: usize, defaults: &ManifestEntry) -> Result<ManifestEntry> {
    let mut entry = ManifestEntry::default();

    let (tag, rest) = line.split_once(':').ok_or_else(|| BrewError::ManifestParse {
        line: line_no,
        text: line.to_string(),
        reason: "manifest line missing ':'".to_string(),
    })?;
    entry.tags = vec![tag.trim().to_string()];

    let (repo, rest) = rest.split_once('@').ok_or_else(|| BrewError::ManifestParse {
        line: line_no,
        text: line.to_string(),
        reason: "manifest line missing '@'".to_string(),
    })?;
    entry.git_repo = Some(repo.trim().to_string());

    match rest.trim().split_once(' ') {
        Some((commit, directory)) => {
            entry.git_commit = Some(commit.trim().to_string());
            entry.directory = Some(directory.trim().to_string());
        }
        None => entry.git_commit = Some(rest.trim().to_string()),
    }

    Ok(entry.defaults_from(defaults))
}

pub fn parse_line_based(input: &str) -> Result<Manifest> {
    let mut global = default_entry();
    global.maintainers = vec![r#"TODO parse old-style "maintainer:" comment lines?"#.to_string()];
    global.git_fetch = Some(DEFAULT_LINE_BASED_FETCH.to_string());

    let mut manifest = Manifest {
        global,
        entries: Vec::new(),
    };

    for (idx, raw) in input.lines().enumerate() {
        let line = raw.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = parse_line(line, idx + 1, &manifest.global)?;
        manifest.add_entry(entry)?;
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse;

    #[test]
    fn line_based_entries_and_tag_fallback() {
        let manifest = parse("a: b@c d\ne: b@c d\nf: g@h\ni: g@h j\n").unwrap();

        assert_eq!(manifest.entries.len(), 3);

        let first = &manifest.entries[0];
        assert_eq!(first.tags, vec!["a", "e"]);
        assert_eq!(first.git_repo.as_deref(), Some("b"));
        assert_eq!(first.git_commit.as_deref(), Some("c"));
        assert_eq!(first.directory.as_deref(), Some("d"));

        let second = &manifest.entries[1];
        assert_eq!(second.tags, vec!["f"]);
        assert_eq!(second.git_repo.as_deref(), Some("g"));
        assert_eq!(second.git_fetch.as_deref(), Some("refs/tags/h"));
        assert_eq!(second.git_commit.as_deref(), Some("FETCH_HEAD"));
        assert_eq!(second.directory.as_deref(), Some("."));

        let third = &manifest.entries[2];
        assert_eq!(third.tags, vec!["i"]);
        assert_eq!(third.directory.as_deref(), Some("j"));
    }

    #[test]
    fn comments_are_skipped() {
        let manifest = parse_line_based(
            "# maintainer: Someone <someone@example.com> (@someone)\n\na: b@0ce80411b9f41e9c3a21fc0a1bffba6ae761825a\n",
        )
        .unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(
            manifest.global.git_fetch.as_deref(),
            Some(DEFAULT_LINE_BASED_FETCH)
        );
    }

    #[test]
    fn rendered_line_based_output_shows_fetch_marker() {
        let manifest = parse("f: g@h\n").unwrap();
        let rendered = manifest.to_string();
        assert!(rendered.contains("GitFetch: refs/heads/*"));
        assert!(rendered.contains("Tags: f"));
        assert!(rendered.contains("GitFetch: refs/tags/h"));
        assert!(rendered.contains("GitCommit: FETCH_HEAD"));
    }

    #[test]
    fn missing_separator_is_an_error() {
        assert!(parse_line_based("just some words\n").is_err());
        assert!(parse_line_based("tag: no-commit-here\n").is_err());
    }
}
