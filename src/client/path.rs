//! Path translation between user-visible paths, server-absolute paths
//! and the client's on-disk cache paths.

use std::path::{Path, PathBuf};

/// Join `rel` onto `base`, dropping empty segments so that the result
/// never carries doubled separators.
fn join_clean(base: &str, rel: &str) -> String {
    let mut out = base.trim_end_matches('/').to_owned();
    for segment in rel.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        "/".to_owned()
    } else {
        out
    }
}

/// Translates user paths into their server-absolute form and into the
/// local cache location. Total and deterministic; it never drops
/// segments.
#[derive(Debug, Clone)]
pub struct PathResolver {
    /// The server's configured root directory.
    server_root: String,
    /// The root of the local cache mirror.
    cache_root: PathBuf,
}

impl PathResolver {
    /// Create a resolver for the given server root and cache root.
    pub fn new(server_root: impl Into<String>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            server_root: server_root.into(),
            cache_root: cache_root.into(),
        }
    }

    /// The server root this resolver was built with.
    #[must_use]
    pub fn server_root(&self) -> &str {
        &self.server_root
    }

    /// The cache root this resolver was built with.
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolve a user-supplied path to its server-absolute form.
    ///
    /// An absolute user path is re-rooted under the server root; a
    /// relative one is appended.
    #[must_use]
    pub fn resolve(&self, user_path: &str) -> String {
        join_clean(&self.server_root, user_path)
    }

    /// Resolve a directory and a leaf name in one step.
    #[must_use]
    pub fn resolve_join(&self, directory: &str, name: &str) -> String {
        join_clean(&self.resolve(directory), name)
    }

    /// The cache location mirroring a server-absolute path.
    #[must_use]
    pub fn cache_path(&self, server_path: &str) -> PathBuf {
        self.cache_root.join(server_path.trim_start_matches('/'))
    }
}
