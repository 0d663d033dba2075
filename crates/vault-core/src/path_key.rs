//! Validated absolute path strings.
//!
//! A [`PathKey`] is the canonical form every public operation works with.
//! Construction normalizes redundant leading separators and rejects anything
//! that could alias another path: trailing separators, empty segments, and
//! segments made up entirely of dots (`.`, `..`, `...`, …). Dots are fine
//! anywhere else in a segment.

use crate::error::{FileOpError, OpResult};

const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    path: String,
}

impl PathKey {
    pub fn new(path: &str) -> OpResult<Self> {
        let mut effective = path;
        while effective.starts_with("//") {
            effective = &effective[1..];
        }
        verify_syntax(effective)?;
        Ok(Self {
            path: effective.to_string(),
        })
    }

    pub fn root() -> Self {
        Self {
            path: SEPARATOR.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// The path with the last segment stripped; `None` for the root, which
    /// has no parent.
    pub fn parent(&self) -> Option<PathKey> {
        if self.is_root() {
            return None;
        }
        let cut = self.path.rfind(SEPARATOR).expect("validated absolute path");
        if cut == 0 {
            Some(Self::root())
        } else {
            Some(Self {
                path: self.path[..cut].to_string(),
            })
        }
    }

    /// The last segment of the path.
    pub fn suffix(&self) -> &str {
        let cut = self.path.rfind(SEPARATOR).expect("validated absolute path");
        &self.path[cut + 1..]
    }

    /// Ordered non-empty segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split(SEPARATOR).filter(|s| !s.is_empty())
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

fn verify_syntax(path: &str) -> OpResult<()> {
    if path == "/" {
        return Ok(());
    }

    if !path.starts_with(SEPARATOR) {
        return Err(FileOpError::InvalidPath(format!(
            "path must begin with separator: '{path}'"
        )));
    }

    if path.ends_with(SEPARATOR) {
        return Err(FileOpError::InvalidPath(format!(
            "path may not end with separator: '{path}'"
        )));
    }

    if path.contains("//") {
        return Err(FileOpError::InvalidPath(format!(
            "path may not contain empty segment: '{path}'"
        )));
    }

    for segment in path.split(SEPARATOR).filter(|s| !s.is_empty()) {
        if segment.chars().all(|c| c == '.') {
            return Err(FileOpError::InvalidPath(format!(
                "path may not contain dot-only segment: '{path}'"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_path() {
        assert_eq!(PathKey::new("/jason").unwrap().parent().unwrap().path(), "/");
        assert_eq!(
            PathKey::new("/parent/jason").unwrap().parent().unwrap().path(),
            "/parent"
        );
        assert!(PathKey::new("/").unwrap().parent().is_none());
    }

    #[test]
    fn name_from_path() {
        assert_eq!(PathKey::new("/jason").unwrap().suffix(), "jason");
        assert_eq!(PathKey::new("/parent/jason").unwrap().suffix(), "jason");
    }

    #[test]
    fn segments() {
        let key = PathKey::new("/amb/.java/.userPrefs/jetbrains/_").unwrap();
        let segments: Vec<&str> = key.segments().collect();
        assert_eq!(segments, vec!["amb", ".java", ".userPrefs", "jetbrains", "_"]);
    }

    #[test]
    fn leading_separators_collapse() {
        assert_eq!(PathKey::new("//").unwrap().path(), "/");
        assert_eq!(PathKey::new("///").unwrap().path(), "/");
        assert_eq!(PathKey::new("//good").unwrap().path(), "/good");
        assert_eq!(PathKey::new("///good").unwrap().path(), "/good");
    }

    #[test]
    fn verify_path_syntax() {
        for good in [
            "/",
            "//",
            "/good",
            "/good/good",
            "/good/.good./good",
            "/good/..good../good",
            "/good/good/.good",
            "/good/good/..good",
            "/good/good/good.",
            "/good/good/good..",
        ] {
            assert!(PathKey::new(good).is_ok(), "expected accept: {good}");
        }

        for bad in [
            "",
            "bad",
            "/bad/",
            "/bad//",
            "/bad//bad",
            "/bad/../bad",
            "/bad/.../bad",
            "/bad/..",
            "/bad/...",
        ] {
            assert!(
                matches!(PathKey::new(bad), Err(FileOpError::InvalidPath(_))),
                "expected reject: {bad}"
            );
        }
    }
}
