//! Path utilities.

use std::path::{Component, Path, PathBuf};

/// Expand ~ to the home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.display().to_string();
        }
    }
    path.to_string()
}

/// Join an untrusted relative path onto `base`, refusing anything that could
/// land outside it (absolute paths, drive prefixes, `..` components).
pub fn enclosed_join(base: &Path, member: &str) -> Option<PathBuf> {
    if member.is_empty() || member.contains('\0') {
        return None;
    }

    let normalized = member.replace('\\', "/");
    let mut relative = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if relative.as_os_str().is_empty() {
        return None;
    }

    Some(base.join(relative))
}

/// Reduce an arbitrary string to a file-name-safe slug.
pub fn slugify(value: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Copy a directory tree, returning the files written under `dst`.
/// Symlinks are skipped.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copied.extend(copy_dir_recursive(&entry.path(), &target)?);
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied.push(target);
        }
    }
    copied.sort();
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();

        assert_eq!(expand_home("~"), home.display().to_string());
        assert_eq!(
            expand_home("~/inspector.json"),
            home.join("inspector.json").display().to_string()
        );
        assert_eq!(expand_home("/absolute/path"), "/absolute/path");
        assert_eq!(expand_home("relative/path"), "relative/path");
    }

    #[test]
    fn test_enclosed_join() {
        let base = Path::new("/out/bundle");
        assert_eq!(
            enclosed_join(base, "capture.jsonl"),
            Some(PathBuf::from("/out/bundle/capture.jsonl"))
        );
        assert_eq!(
            enclosed_join(base, "./transcripts/01.log"),
            Some(PathBuf::from("/out/bundle/transcripts/01.log"))
        );
        assert_eq!(enclosed_join(base, "../escape"), None);
        assert_eq!(enclosed_join(base, "a/../../escape"), None);
        assert_eq!(enclosed_join(base, "/etc/passwd"), None);
        assert_eq!(enclosed_join(base, "..\\..\\windows"), None);
        assert_eq!(enclosed_join(base, ""), None);
        assert_eq!(enclosed_join(base, "."), None);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("npm install --verbose", 40), "npm-install-verbose");
        assert_eq!(slugify("https://github.com/a/b.git", 64), "https-github.com-a-b.git");
        assert_eq!(slugify("///", 10), "unnamed");
        assert_eq!(slugify("abcdefghij", 4), "abcd");
    }

    #[test]
    fn test_copy_dir_recursive() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("top.txt"), "1").unwrap();
        std::fs::write(src.path().join("a/b/deep.txt"), "2").unwrap();

        let copied = copy_dir_recursive(src.path(), &dst.path().join("out")).unwrap();
        assert_eq!(copied.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dst.path().join("out/a/b/deep.txt")).unwrap(),
            "2"
        );
    }
}
