//! Working store for extracted faces, one bucket per classroom.
//!
//! The store is never updated incrementally: every extraction run starts with
//! [`ClassroomRepository::rebuild`], so no face from an earlier run survives.

use crate::types::FaceCrop;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CROP_EXTENSION: &str = "jpg";
const FACE_PREFIX: &str = "face_";

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("cannot {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot encode face {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid classroom name {0:?}")]
    InvalidName(String),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> RepositoryError + 'a {
    move |source| RepositoryError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// A classroom bucket that exists in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassroomHandle {
    pub name: String,
    pub location: PathBuf,
}

/// Storage for classroom face buckets.
pub trait ClassroomRepository {
    /// Destroy the whole store and recreate an empty root. Safe on a missing store.
    fn rebuild(&mut self) -> Result<(), RepositoryError>;

    /// Ensure a bucket for `name` exists.
    fn create_classroom(&mut self, name: &str) -> Result<ClassroomHandle, RepositoryError>;

    /// Persist one crop as `face_<index>.<ext>`, returning its location.
    fn save_face(
        &mut self,
        classroom: &ClassroomHandle,
        crop: &FaceCrop,
    ) -> Result<PathBuf, RepositoryError>;

    /// Classroom names in lexicographic order.
    fn list_classrooms(&self) -> Result<Vec<String>, RepositoryError>;

    /// `None` when no bucket named `name` exists.
    fn open_classroom(&self, name: &str) -> Result<Option<ClassroomHandle>, RepositoryError>;

    /// Locations of every stored face, ordered by face index.
    fn list_faces(&self, classroom: &ClassroomHandle) -> Result<Vec<PathBuf>, RepositoryError>;
}

pub fn face_file_name(index: u32, extension: &str) -> String {
    format!("{FACE_PREFIX}{index}.{extension}")
}

/// Parse the index out of a `face_<n>.<ext>` file name.
pub fn face_index(file_name: &str) -> Option<u32> {
    let stem = file_name.split('.').next()?;
    stem.strip_prefix(FACE_PREFIX)?.parse().ok()
}

fn validate_name(name: &str) -> Result<(), RepositoryError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\']);
    if bad {
        return Err(RepositoryError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Directory-tree store: `<root>/<classroom>/face_<n>.<ext>`.
pub struct FsClassroomRepository {
    root: PathBuf,
    extension: String,
}

impl FsClassroomRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: DEFAULT_CROP_EXTENSION.to_string(),
        }
    }

    /// Image format of saved crops, chosen by extension (`jpg`, `png`, ...).
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ClassroomRepository for FsClassroomRepository {
    fn rebuild(&mut self) -> Result<(), RepositoryError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => tracing::debug!(root = %self.root.display(), "removed old working store"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("remove", &self.root)(e)),
        }
        std::fs::create_dir_all(&self.root).map_err(io_err("create", &self.root))?;
        tracing::info!(root = %self.root.display(), "working store rebuilt");
        Ok(())
    }

    fn create_classroom(&mut self, name: &str) -> Result<ClassroomHandle, RepositoryError> {
        validate_name(name)?;
        let location = self.root.join(name);
        std::fs::create_dir_all(&location).map_err(io_err("create", &location))?;
        Ok(ClassroomHandle {
            name: name.to_string(),
            location,
        })
    }

    fn save_face(
        &mut self,
        classroom: &ClassroomHandle,
        crop: &FaceCrop,
    ) -> Result<PathBuf, RepositoryError> {
        let path = classroom
            .location
            .join(face_file_name(crop.index, &self.extension));

        if crop.is_empty() {
            // Zero-byte placeholder keeps the index visible on disk.
            std::fs::write(&path, b"").map_err(io_err("write", &path))?;
        } else {
            crop.image
                .save(&path)
                .map_err(|source| RepositoryError::Encode {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(path)
    }

    fn list_classrooms(&self) -> Result<Vec<String>, RepositoryError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("list", &self.root)(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err("list", &self.root))?;
            if !entry.path().is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => tracing::warn!(name = ?raw, "skipping non-UTF-8 classroom folder"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn open_classroom(&self, name: &str) -> Result<Option<ClassroomHandle>, RepositoryError> {
        validate_name(name)?;
        let location = self.root.join(name);
        Ok(location.is_dir().then(|| ClassroomHandle {
            name: name.to_string(),
            location,
        }))
    }

    fn list_faces(&self, classroom: &ClassroomHandle) -> Result<Vec<PathBuf>, RepositoryError> {
        let dir = &classroom.location;
        let mut faces = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err("list", dir))? {
            let entry = entry.map_err(io_err("list", dir))?;
            let path = entry.path();
            if path.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                faces.push((face_index(&name).unwrap_or(u32::MAX), name, path));
            }
        }
        faces.sort();
        Ok(faces.into_iter().map(|(_, _, path)| path).collect())
    }
}

/// In-memory store. Locations are synthetic paths under `root`; nothing is
/// written to disk.
#[derive(Default)]
pub struct MemoryClassroomRepository {
    root: PathBuf,
    classrooms: BTreeMap<String, BTreeMap<u32, FaceCrop>>,
}

impl MemoryClassroomRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            classrooms: BTreeMap::new(),
        }
    }

    pub fn face(&self, classroom: &str, index: u32) -> Option<&FaceCrop> {
        self.classrooms.get(classroom)?.get(&index)
    }

    pub fn face_count(&self, classroom: &str) -> usize {
        self.classrooms.get(classroom).map_or(0, BTreeMap::len)
    }
}

impl ClassroomRepository for MemoryClassroomRepository {
    fn rebuild(&mut self) -> Result<(), RepositoryError> {
        self.classrooms.clear();
        Ok(())
    }

    fn create_classroom(&mut self, name: &str) -> Result<ClassroomHandle, RepositoryError> {
        validate_name(name)?;
        self.classrooms.entry(name.to_string()).or_default();
        Ok(ClassroomHandle {
            name: name.to_string(),
            location: self.root.join(name),
        })
    }

    fn save_face(
        &mut self,
        classroom: &ClassroomHandle,
        crop: &FaceCrop,
    ) -> Result<PathBuf, RepositoryError> {
        self.classrooms
            .entry(classroom.name.clone())
            .or_default()
            .insert(crop.index, crop.clone());
        Ok(classroom
            .location
            .join(face_file_name(crop.index, DEFAULT_CROP_EXTENSION)))
    }

    fn list_classrooms(&self) -> Result<Vec<String>, RepositoryError> {
        Ok(self.classrooms.keys().cloned().collect())
    }

    fn open_classroom(&self, name: &str) -> Result<Option<ClassroomHandle>, RepositoryError> {
        Ok(self.classrooms.contains_key(name).then(|| ClassroomHandle {
            name: name.to_string(),
            location: self.root.join(name),
        }))
    }

    fn list_faces(&self, classroom: &ClassroomHandle) -> Result<Vec<PathBuf>, RepositoryError> {
        Ok(self
            .classrooms
            .get(&classroom.name)
            .map(|faces| {
                faces
                    .keys()
                    .map(|&i| classroom.location.join(face_file_name(i, DEFAULT_CROP_EXTENSION)))
                    .collect()
            })
            .unwrap_or_default())
    }
}
