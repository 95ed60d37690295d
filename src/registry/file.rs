use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use super::{content_hash, RefError};

/// Marker file that pins the directory files are served relative to.
pub const ANCHOR_MARKER: &str = "livepage-anchor";

/// Maps local files to URL-safe names.
///
/// Each file is served relative to an anchor directory: the nearest
/// ancestor that is already registered, else the nearest ancestor holding
/// an [`ANCHOR_MARKER`] file, else the file's own directory. The anchor is
/// published under a hash of its path so local paths never leak.
#[derive(Debug, Default)]
pub struct FileRegistry {
    dir_to_url: HashMap<PathBuf, String>,
    url_to_dir: HashMap<String, PathBuf>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: &Path) -> String {
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let (anchor, url) = self.find_anchor(&path);
        let relative = path
            .strip_prefix(&anchor)
            .unwrap_or(&path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        format!("{url}/{relative}")
    }

    fn find_anchor(&mut self, path: &Path) -> (PathBuf, String) {
        for ancestor in path.ancestors().skip(1) {
            if let Some(url) = self.dir_to_url.get(ancestor) {
                return (ancestor.to_path_buf(), url.clone());
            }
        }

        let anchor = path
            .ancestors()
            .skip(1)
            .find(|dir| dir.join(ANCHOR_MARKER).is_file())
            .or_else(|| path.parent())
            .unwrap_or(path)
            .to_path_buf();
        let url = content_hash(anchor.to_string_lossy().as_bytes());
        self.dir_to_url.insert(anchor.clone(), url.clone());
        self.url_to_dir.insert(url.clone(), anchor.clone());
        (anchor, url)
    }

    /// Map a URL produced by [`FileRegistry::register`] back to a local path.
    ///
    /// Paths that would escape the anchor directory are rejected.
    pub fn resolve(&self, url: &str) -> Result<PathBuf, RefError> {
        let not_found = || RefError::NotFound(url.to_string());
        let (head, rest) = url.split_once('/').ok_or_else(not_found)?;
        let anchor = self.url_to_dir.get(head).ok_or_else(not_found)?;
        let mut resolved = anchor.clone();
        for part in rest.split('/') {
            match part {
                "" | "." => continue,
                ".." => return Err(not_found()),
                part if part.contains('\\') => return Err(not_found()),
                part => resolved.push(part),
            }
        }
        if resolved == *anchor {
            return Err(not_found());
        }
        Ok(resolved)
    }
}
