//! Slash-separated virtual paths.
//!
//! A condensed relative of jj-lib's `repo_path.rs`: that file models paths
//! relative to a workspace root with `RepoPath`/`RepoPathBuf` and a
//! `RepoPathComponent` newtype per segment. We keep the owned/borrowed split
//! and the component iteration, but drop jj's platform-specific
//! normalization and `Debug`-as-quoted-string concerns, since this crate's
//! paths are always absolute (`"/"`-rooted) virtual-filesystem paths, not
//! paths relative to a materialized working copy.

use std::fmt;

/// An absolute, `/`-separated virtual path. The root path is `"/"` and has
/// an empty basename and no parent (spec.md §3).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPathBuf(String);

impl RepoPathBuf {
    pub fn root() -> Self {
        Self("/".to_owned())
    }

    /// Parses `s`, inserting a leading `/` if missing and stripping any
    /// trailing `/` (except for the root itself).
    pub fn parse(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        let mut owned = if s.starts_with('/') {
            s.to_owned()
        } else {
            format!("/{s}")
        };
        while owned.len() > 1 && owned.ends_with('/') {
            owned.pop();
        }
        Self(owned)
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-recursive path components, in order.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last path segment; the root's basename is `""` (spec.md §3).
    pub fn basename(&self) -> &str {
        self.components().next_back().unwrap_or("")
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_owned())),
            None => None,
        }
    }

    pub fn join(&self, component: &str) -> Self {
        if self.is_root() {
            Self(format!("/{component}"))
        } else {
            Self(format!("{}/{component}", self.0))
        }
    }

    /// Canonical KV key form used for directory path indices: a trailing
    /// `/.`, per spec.md §4.D ("Directory paths are canonicalized with a
    /// trailing `/.` when used as keys").
    pub fn as_directory_key(&self) -> String {
        if self.is_root() {
            "/.".to_owned()
        } else {
            format!("{}/.", self.0)
        }
    }
}

impl fmt::Debug for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPathBuf({:?})", self.0)
    }
}

impl fmt::Display for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RepoPathBuf {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for RepoPathBuf {
    fn from(s: String) -> Self {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_empty_basename_and_no_parent() {
        let root = RepoPathBuf::root();
        assert_eq!(root.basename(), "");
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn parent_chain() {
        let p = RepoPathBuf::parse("/a/b/c.png");
        assert_eq!(p.basename(), "c.png");
        let parent = p.parent().unwrap();
        assert_eq!(parent.as_str(), "/a/b");
        assert_eq!(parent.parent().unwrap().as_str(), "/a");
        assert_eq!(parent.parent().unwrap().parent().unwrap(), RepoPathBuf::root());
    }

    #[test]
    fn join_from_root() {
        let root = RepoPathBuf::root();
        assert_eq!(root.join("cat.png").as_str(), "/cat.png");
    }

    #[test]
    fn directory_key_adds_trailing_dot() {
        assert_eq!(RepoPathBuf::parse("/sub").as_directory_key(), "/sub/.");
        assert_eq!(RepoPathBuf::root().as_directory_key(), "/.");
    }

    #[test]
    fn trailing_slash_is_normalized() {
        assert_eq!(RepoPathBuf::parse("/sub/"), RepoPathBuf::parse("/sub"));
    }
}
