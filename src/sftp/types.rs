//! SFTP types

use serde::{Deserialize, Serialize};

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
    Link,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default)]
    pub size: u64,
    /// Modification time (unix seconds)
    #[serde(default)]
    pub modified: i64,
}

/// Directories first, then by name
pub fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| {
        let a_is_dir = a.entry_type == EntryType::Directory;
        let b_is_dir = b.entry_type == EntryType::Directory;
        b_is_dir
            .cmp(&a_is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// Join a remote base path and one component with `/`
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Parent directory of a remote path (`/` for top-level entries)
pub fn remote_parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Destination of a rename: a bare name stays in the source's directory,
/// anything containing `/` is taken as the full destination path.
pub fn rename_target(path: &str, new_name: &str) -> String {
    if new_name.contains('/') {
        new_name.to_string()
    } else {
        join_remote_path(remote_parent(path), new_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_target() {
        assert_eq!(rename_target("/home/me/a.txt", "b.txt"), "/home/me/b.txt");
        assert_eq!(rename_target("/a.txt", "b.txt"), "/b.txt");
        assert_eq!(rename_target("/home/me/dir/", "renamed"), "/home/me/renamed");
        assert_eq!(rename_target("/home/me/a.txt", "/tmp/a.txt"), "/tmp/a.txt");
    }

    #[test]
    fn test_sort_directories_first() {
        let entry = |name: &str, entry_type| DirEntry {
            name: name.into(),
            entry_type,
            size: 0,
            modified: 0,
        };
        let mut entries = vec![
            entry("b.txt", EntryType::File),
            entry("Zeta", EntryType::Directory),
            entry("a.txt", EntryType::File),
            entry("alpha", EntryType::Directory),
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Zeta", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_entry_serializes_type_field() {
        let json = serde_json::to_value(DirEntry {
            name: "etc".into(),
            entry_type: EntryType::Directory,
            size: 4096,
            modified: 0,
        })
        .unwrap();
        assert_eq!(json["type"], "directory");
    }
}
