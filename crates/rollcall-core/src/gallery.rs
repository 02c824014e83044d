//! Known identities, loaded from a directory of reference face images.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One known person and their reference face image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Reference file name without extension.
    pub name: String,
    pub reference: PathBuf,
}

/// Insertion-ordered identity set. Gallery order is report row order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityGallery {
    identities: Vec<Identity>,
}

impl IdentityGallery {
    /// Load every regular file in `dir`, keyed by file stem, in file-name order.
    ///
    /// A missing or empty directory yields an empty gallery.
    pub fn load(dir: &Path) -> Result<Self, GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(dir = %dir.display(), "gallery directory missing; no identities loaded");
                return Ok(Self::default());
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut gallery = Self::default();
        for path in files {
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => gallery.insert(name, path.clone()),
                None => tracing::warn!(path = %path.display(), "skipping reference with unusable name"),
            }
        }

        tracing::debug!(dir = %dir.display(), identities = gallery.len(), "gallery loaded");
        Ok(gallery)
    }

    /// Add an identity. A repeated name replaces the reference but keeps its
    /// original position.
    pub fn insert(&mut self, name: &str, reference: PathBuf) {
        match self.identities.iter_mut().find(|i| i.name == name) {
            Some(existing) => {
                tracing::warn!(
                    identity = name,
                    old = %existing.reference.display(),
                    new = %reference.display(),
                    "duplicate identity name; later reference wins"
                );
                existing.reference = reference;
            }
            None => self.identities.push(Identity {
                name: name.to_string(),
                reference,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Identity> {
        self.identities.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|i| i.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.name == name)
    }
}

impl FromIterator<(String, PathBuf)> for IdentityGallery {
    fn from_iter<T: IntoIterator<Item = (String, PathBuf)>>(iter: T) -> Self {
        let mut gallery = Self::default();
        for (name, reference) in iter {
            gallery.insert(&name, reference);
        }
        gallery
    }
}

impl<'a> IntoIterator for &'a IdentityGallery {
    type Item = &'a Identity;
    type IntoIter = std::slice::Iter<'a, Identity>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
