use std::collections::HashMap;

use bytes::Bytes;

use super::{content_hash, RefError};

/// In-memory content served under a content-addressed name.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualFile {
    pub name: String,
    pub media_type: String,
    pub content: Bytes,
}

impl VirtualFile {
    /// Build a virtual file. The media type is guessed from the suggested
    /// name when not given.
    pub fn new(content: impl Into<Bytes>, name: Option<&str>, media_type: Option<&str>) -> Self {
        let content = content.into();
        let name = name.unwrap_or("file").trim_start_matches('/').to_string();
        let media_type = media_type.map(str::to_string).unwrap_or_else(|| {
            mime_guess::from_path(&name)
                .first_or_octet_stream()
                .to_string()
        });
        Self {
            name,
            media_type,
            content,
        }
    }

    /// The URL-safe name: content hash followed by the suggested name.
    pub fn key(&self) -> String {
        format!("{}/{}", content_hash(&self.content), self.name)
    }
}

#[derive(Debug, Default)]
pub struct VFileRegistry {
    files: HashMap<String, VirtualFile>,
}

impl VFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and return the file's name. Identical content under the
    /// same suggested name maps to the same entry.
    pub fn register(&mut self, file: VirtualFile) -> String {
        let key = file.key();
        self.files.entry(key.clone()).or_insert(file);
        key
    }

    pub fn resolve(&self, name: &str) -> Result<VirtualFile, RefError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| RefError::NotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
