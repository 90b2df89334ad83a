//! Client filelists: the line-oriented listing a client serves at the start
//! of a file backup, and the diff against the previous run that decides
//! which files actually travel.

use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Remote name under which a client serves its current filelist.
pub const FILELIST_NAME: &str = "filelist.ub";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListEntry {
    /// Forward-slash relative path.
    pub path: String,
    pub is_dir: bool,
    pub size: i64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
}

fn escape(path: &str) -> String {
    path.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// One entry per line: `d "path"` or `f "path" <size> <mtime>`.
pub fn serialize(entries: &[FileListEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        if e.is_dir {
            out.push_str(&format!("d \"{}\"\n", escape(&e.path)));
        } else {
            out.push_str(&format!("f \"{}\" {} {}\n", escape(&e.path), e.size, e.mtime));
        }
    }
    out
}

pub fn parse(data: &str) -> anyhow::Result<Vec<FileListEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (kind, rest) = line
            .split_once(' ')
            .ok_or_else(|| anyhow::anyhow!("filelist line {} malformed", lineno + 1))?;
        if !rest.starts_with('"') {
            anyhow::bail!("filelist line {} missing quoted path", lineno + 1);
        }

        // Find the closing quote, honoring escapes.
        let bytes = rest.as_bytes();
        let mut end = None;
        let mut i = 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'"' => {
                    end = Some(i);
                    break;
                }
                _ => i += 1,
            }
        }
        let end = end.ok_or_else(|| anyhow::anyhow!("filelist line {} unterminated path", lineno + 1))?;
        let path = unescape(&rest[1..end]);
        let tail = rest[end + 1..].trim();

        match kind {
            "d" => entries.push(FileListEntry { path, is_dir: true, size: 0, mtime: 0 }),
            "f" => {
                let mut parts = tail.split_whitespace();
                let size: i64 = parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("filelist line {} missing size", lineno + 1))?
                    .parse()?;
                let mtime: i64 = parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("filelist line {} missing mtime", lineno + 1))?
                    .parse()?;
                entries.push(FileListEntry { path, is_dir: false, size, mtime });
            }
            other => anyhow::bail!("filelist line {} unknown kind {:?}", lineno + 1, other),
        }
    }
    Ok(entries)
}

/// Walk a directory into filelist entries; the in-process peer uses this to
/// answer filelist downloads.
pub fn build_from_dir(root: &Path) -> io::Result<Vec<FileListEntry>> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if entry.file_type().is_dir() {
            entries.push(FileListEntry { path: rel, is_dir: true, size: 0, mtime: 0 });
        } else if entry.file_type().is_file() {
            let meta = entry.metadata().map_err(io::Error::other)?;
            let mtime = meta
                .modified()?
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            entries.push(FileListEntry {
                path: rel,
                is_dir: false,
                size: meta.len() as i64,
                mtime,
            });
        }
    }
    Ok(entries)
}

#[derive(Debug, Default)]
pub struct FileListDiff {
    /// New or modified files, to be transferred.
    pub changed: Vec<FileListEntry>,
    /// Present in both lists with equal size and mtime.
    pub unchanged: Vec<FileListEntry>,
    /// Directories in the new list.
    pub dirs: Vec<FileListEntry>,
    /// Paths gone since the previous list.
    pub deleted: Vec<String>,
}

/// Size+mtime diff between the previous and current listing.
pub fn diff(old: &[FileListEntry], new: &[FileListEntry]) -> FileListDiff {
    let old_files: HashMap<&str, &FileListEntry> =
        old.iter().filter(|e| !e.is_dir).map(|e| (e.path.as_str(), e)).collect();

    let mut out = FileListDiff::default();
    for entry in new {
        if entry.is_dir {
            out.dirs.push(entry.clone());
            continue;
        }
        match old_files.get(entry.path.as_str()) {
            Some(prev) if prev.size == entry.size && prev.mtime == entry.mtime => {
                out.unchanged.push(entry.clone());
            }
            _ => out.changed.push(entry.clone()),
        }
    }

    let new_paths: HashMap<&str, ()> =
        new.iter().filter(|e| !e.is_dir).map(|e| (e.path.as_str(), ())).collect();
    for entry in old.iter().filter(|e| !e.is_dir) {
        if !new_paths.contains_key(entry.path.as_str()) {
            out.deleted.push(entry.path.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: i64, mtime: i64) -> FileListEntry {
        FileListEntry { path: path.into(), is_dir: false, size, mtime }
    }

    #[test]
    fn serialize_parse_round_trip() {
        let entries = vec![
            FileListEntry { path: "docs".into(), is_dir: true, size: 0, mtime: 0 },
            file("docs/a.txt", 100, 1700000000),
            file("weird \"name\"\\x", 5, 9),
        ];
        let text = serialize(&entries);
        let back = parse(&text).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse("f \"unterminated").is_err());
        assert!(parse("x \"p\" 1 2").is_err());
        assert!(parse("f \"p\" notanumber 2").is_err());
    }

    #[test]
    fn diff_classifies_entries() {
        let old = vec![file("same", 10, 1), file("touched", 10, 1), file("gone", 3, 3)];
        let new = vec![
            file("same", 10, 1),
            file("touched", 10, 2),
            file("fresh", 7, 7),
            FileListEntry { path: "newdir".into(), is_dir: true, size: 0, mtime: 0 },
        ];
        let d = diff(&old, &new);
        assert_eq!(d.unchanged.len(), 1);
        assert_eq!(d.unchanged[0].path, "same");
        let changed: Vec<_> = d.changed.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(changed, vec!["touched", "fresh"]);
        assert_eq!(d.deleted, vec!["gone".to_string()]);
        assert_eq!(d.dirs.len(), 1);
    }
}
