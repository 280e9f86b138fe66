//! Deterministic ("scrubbed") tar writer over a commit filesystem.
//!
//! Headers keep only typeflag, name, linkname, size, mode, devmajor and
//! devminor; uid/gid/uname/gname and all timestamps are zeroed. The root
//! entry is omitted (matching `git archive`), directory names end in `/`,
//! and the stream ends after the last entry with no end-of-archive blocks
//! so the sink may be a tee'd hasher.

use std::io::Write;

use sha2::{Digest, Sha256};

use crate::error::{BrewError, Result};
use crate::gitstore::{CommitFs, FileKind};

const BLOCK_SIZE: usize = 512;

/// Write the scrubbed archive of `fs` to `out`.
pub fn write_tar(fs: &CommitFs, out: &mut dyn Write) -> Result<()> {
    walk(fs, "", out)
}

/// Pre-order walk: each directory's header is followed immediately by its
/// children, siblings in sorted order.
fn walk(fs: &CommitFs, dir: &str, out: &mut dyn Write) -> Result<()> {
    let entries = fs.read_dir(if dir.is_empty() { "." } else { dir })?;
    for entry in entries {
        let path = if dir.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", dir, entry.name)
        };
        match entry.kind {
            FileKind::Dir | FileKind::Gitlink => {
                write_header(
                    out,
                    &format!("{}/", path),
                    tar::EntryType::Directory,
                    0,
                    entry.kind.mode(),
                    "",
                )?;
                walk(fs, &path, out)?;
            }
            FileKind::Symlink => {
                let target = fs.read_link(&path)?;
                write_header(out, &path, tar::EntryType::Symlink, 0, entry.kind.mode(), &target)?;
            }
            FileKind::Regular | FileKind::Executable => {
                let data = fs.read_file(&path)?;
                write_header(
                    out,
                    &path,
                    tar::EntryType::Regular,
                    data.len() as u64,
                    entry.kind.mode(),
                    "",
                )?;
                write_padded(out, &data)?;
            }
        }
    }
    Ok(())
}

/// SHA-256 of the scrubbed archive: the reproducible context checksum.
pub fn checksum(fs: &CommitFs) -> Result<String> {
    let mut hasher = Sha256::new();
    write_tar(fs, &mut HashWriter(&mut hasher))?;
    Ok(hex::encode(hasher.finalize()))
}

struct HashWriter<'a>(&'a mut Sha256);

impl Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn write_header(
    out: &mut dyn Write,
    name: &str,
    entry_type: tar::EntryType,
    size: u64,
    mode: u32,
    link_name: &str,
) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);

    if header.set_path(name).is_err() {
        // name too long for ustar: emit a GNU long-name entry first
        write_gnu_long(out, b'L', name.as_bytes())?;
        let truncated = truncate_name(name);
        header
            .set_path(&truncated)
            .map_err(|e| BrewError::io(name, e))?;
    }
    if !link_name.is_empty() {
        if header.set_link_name(link_name).is_err() {
            write_gnu_long(out, b'K', link_name.as_bytes())?;
            let truncated = truncate_name(link_name);
            header
                .set_link_name(&truncated)
                .map_err(|e| BrewError::io(name, e))?;
        }
    }

    header.set_cksum();
    out.write_all(header.as_bytes())
        .map_err(|e| BrewError::io(name, e))?;
    Ok(())
}

/// A `././@LongLink` entry carrying an over-long name or link target.
fn write_gnu_long(out: &mut dyn Write, typeflag: u8, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    {
        let gnu = header.as_gnu_mut().expect("gnu header");
        let name = b"././@LongLink";
        gnu.name[..name.len()].copy_from_slice(name);
    }
    header.set_entry_type(tar::EntryType::new(typeflag));
    header.set_size(data.len() as u64 + 1);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    out.write_all(header.as_bytes())
        .map_err(|e| BrewError::io("@LongLink", e))?;
    let mut padded = data.to_vec();
    padded.push(0);
    write_padded(out, &padded)
}

fn truncate_name(name: &str) -> String {
    let max = 100.min(name.len());
    name[..max].to_string()
}

fn write_padded(out: &mut dyn Write, data: &[u8]) -> Result<()> {
    out.write_all(data).map_err(|e| BrewError::io("tar data", e))?;
    let remainder = data.len() % BLOCK_SIZE;
    if remainder != 0 {
        let padding = vec![0u8; BLOCK_SIZE - remainder];
        out.write_all(&padding)
            .map_err(|e| BrewError::io("tar padding", e))?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::gitstore::testutil;
    use crate::gitstore::{GitSource, GitStore};

    async fn fixture_fs() -> (tempfile::TempDir, GitStore, String) {
        let source_dir = tempfile::TempDir::new().unwrap();
        let commit = testutil::init_source_repo(source_dir.path());

        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = GitStore::new(cache_dir.path());
        let url = source_dir.path().to_str().unwrap().to_string();
        store
            .resolve_commit(
                GitSource {
                    repo: &url,
                    fetch: "refs/heads/main",
                    commit: &commit,
                },
                "",
            )
            .await
            .unwrap();
        (cache_dir, store, commit)
    }

    #[tokio::test]
    async fn archive_is_deterministic() {
        let (_cache, store, commit) = fixture_fs().await;
        let fs = store.commit_fs(&commit).unwrap();

        let mut first = Vec::new();
        write_tar(&fs, &mut first).unwrap();
        let mut second = Vec::new();
        write_tar(&fs, &mut second).unwrap();
        assert_eq!(first, second);

        assert_eq!(checksum(&fs).unwrap(), hex::encode(sha2::Sha256::digest(&first)));

        // sub-rooted views are deterministic too
        let sub = fs.sub("sub").unwrap();
        let a = checksum(&sub).unwrap();
        let b = checksum(&store.commit_fs(&commit).unwrap().sub("sub").unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn headers_are_scrubbed() {
        let (_cache, store, commit) = fixture_fs().await;
        let fs = store.commit_fs(&commit).unwrap();

        let mut bytes = Vec::new();
        write_tar(&fs, &mut bytes).unwrap();

        // no end-of-archive zero blocks
        let tail = &bytes[bytes.len() - 1024..];
        assert!(tail.iter().any(|b| *b != 0));

        let mut archive = tar::Archive::new(std::io::Cursor::new({
            // give the reader a proper terminator
            let mut terminated = bytes.clone();
            terminated.extend_from_slice(&[0u8; 1024]);
            terminated
        }));

        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            assert_eq!(header.mtime().unwrap(), 0);
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
        }

        assert_eq!(
            names,
            vec![
                "Dockerfile",
                "sub/",
                "sub/abs-link",
                "sub/escape-link",
                "sub/file.txt",
                "sub/link.txt",
                "sub/tool.sh",
            ]
        );
    }

    #[tokio::test]
    async fn symlink_entries_carry_their_target() {
        let (_cache, store, commit) = fixture_fs().await;
        let fs = store.commit_fs(&commit).unwrap().sub("sub").unwrap();

        let mut bytes = Vec::new();
        write_tar(&fs, &mut bytes).unwrap();
        bytes.extend_from_slice(&[0u8; 1024]);

        let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "link.txt" {
                assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
                assert_eq!(
                    entry.link_name().unwrap().unwrap().to_string_lossy(),
                    "file.txt"
                );
                found = true;
            }
        }
        assert!(found);
    }
}
