//! Container build-file analyzer.
//!
//! A line-oriented scan extracting only the dependency-relevant bits of a
//! build file: the base image of every stage (`FROM`), cross-stage copies
//! (`COPY --from=`), and bind mounts from other images
//! (`RUN --mount=type=bind,from=`). Named and numbered stage references
//! are resolved back to their external base image; everything else is
//! ignored, malformed lines included.

use std::collections::HashMap;

/// The dependency metadata extracted from one build file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// The external image each stage is rooted in (stage references
    /// resolved), in stage order.
    pub stage_froms: Vec<String>,
    /// Names of named stages (`FROM x AS name`), in order.
    pub stage_names: Vec<String>,
    /// Stage name -> external image of that stage.
    pub stage_name_froms: HashMap<String, String>,
    /// Every external image reference, in order: `FROM`, `COPY --from=`,
    /// `RUN --mount=type=bind,from=` (minus stage self-references).
    pub froms: Vec<String>,
}

impl Metadata {
    /// The constant metadata used for `oci-import` entries.
    pub fn scratch() -> Metadata {
        parse("FROM scratch")
    }
}

/// Append `:latest` when the reference has no tag (`scratch` excepted).
fn latestize(repo_tag: &str) -> String {
    if repo_tag != "scratch" && !repo_tag.contains(':') {
        format!("{}:latest", repo_tag)
    } else {
        repo_tag.to_string()
    }
}

/// Parse a build file's dependency metadata. Only I/O can fail upstream;
/// malformed instructions here are simply ignored.
pub fn parse(buildfile: &str) -> Metadata {
    let mut meta = Metadata::default();

    let mut lines = buildfile.lines();
    while let Some(raw) = lines.next() {
        let mut line = raw.trim().to_string();

        if line.is_empty() {
            continue;
        }
        // a comment cannot end in a continuation; the backslash is part of
        // the comment
        if line.starts_with('#') {
            continue;
        }

        // join continuation lines; blank or comment continuations are
        // skipped, and whitespace after the backslash is tolerated
        while line.ends_with('\\') {
            let next = match lines.next() {
                Some(next) => next,
                None => {
                    line.pop();
                    break;
                }
            };
            let next = next.trim_end();
            if next.is_empty() {
                continue;
            }
            if next.trim_start().starts_with('#') {
                continue;
            }
            line.pop();
            line.push_str(next);
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        let instruction = fields[0].to_uppercase();
        match instruction.as_str() {
            "FROM" => {
                let mut from = match fields.get(1) {
                    Some(from) => from.to_string(),
                    None => continue,
                };

                // a stage name resolves back to the external image of the
                // stage it references
                if let Some(stage_from) = meta.stage_name_froms.get(&from) {
                    from = stage_from.clone();
                }

                let from = latestize(&from);
                meta.stage_froms.push(from.clone());
                meta.froms.push(from.clone());

                if fields.len() == 4 && fields[2].eq_ignore_ascii_case("AS") {
                    let stage_name = fields[3].to_string();
                    meta.stage_names.push(stage_name.clone());
                    meta.stage_name_froms.insert(stage_name, from);
                }
            }

            "COPY" => {
                for arg in &fields[1..] {
                    if !arg.starts_with("--") {
                        // first positional argument ends flag scanning
                        break;
                    }
                    let Some(from) = arg.strip_prefix("--from=") else {
                        continue;
                    };
                    let from = resolve_stage_ref(&meta, from);
                    meta.froms.push(latestize(&from));
                }
            }

            "RUN" => {
                for arg in &fields[1..] {
                    if !arg.starts_with("--") {
                        break;
                    }
                    let Some(csv) = arg.strip_prefix("--mount=") else {
                        continue;
                    };
                    let mut mount_type = "";
                    let mut from = "";
                    for field in csv.split(',') {
                        if let Some(value) = field.strip_prefix("type=") {
                            mount_type = value;
                        } else if let Some(value) = field.strip_prefix("from=") {
                            from = value;
                        }
                    }
                    if mount_type != "bind" || from.is_empty() {
                        continue;
                    }
                    let from = resolve_stage_ref(&meta, from);
                    meta.froms.push(latestize(&from));
                }
            }

            _ => {}
        }
    }

    meta
}

/// Resolve a `--from=` / `from=` reference: stage name first, then stage
/// number, then verbatim.
fn resolve_stage_ref(meta: &Metadata, reference: &str) -> String {
    if let Some(stage_from) = meta.stage_name_froms.get(reference) {
        return stage_from.clone();
    }
    if let Ok(stage_number) = reference.parse::<usize>() {
        if stage_number < meta.stage_froms.len() {
            return meta.stage_froms[stage_number].clone();
        }
    }
    reference.to_string()
}
