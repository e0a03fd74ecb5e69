//! Enrolled face embeddings, loaded once per session.

use crate::session::FaceBackend;
use crate::types::{Embedding, GalleryEntry};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Image extensions accepted in a gallery directory (case-insensitive).
pub const GALLERY_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Closest gallery entry to a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryMatch {
    pub identity: String,
    pub distance: f32,
}

/// Immutable set of enrolled face embeddings.
#[derive(Debug, Clone, Default)]
pub struct FaceGallery {
    entries: Vec<GalleryEntry>,
}

impl FaceGallery {
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Load `root/<identity>/<image>` into a gallery.
    ///
    /// Only the first face of each image is enrolled. Unreadable identity
    /// directories and images, backend failures and images without a face
    /// are logged and skipped; only an unreadable root is an error.
    pub fn load_dir<B: FaceBackend>(root: &Path, backend: &mut B) -> Result<Self, GalleryError> {
        let mut entries = Vec::new();

        for identity_dir in sorted_entries(root)? {
            if !identity_dir.is_dir() {
                continue;
            }
            let Some(identity) = identity_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let images = match sorted_entries(&identity_dir) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(identity, error = %e, "skipping unreadable identity directory");
                    continue;
                }
            };

            for image_path in images {
                if !image_path.is_file() || !has_gallery_extension(&image_path) {
                    continue;
                }
                match enroll_image(&image_path, backend) {
                    Ok(Some(embedding)) => {
                        tracing::debug!(identity, path = %image_path.display(), "enrolled face");
                        entries.push(GalleryEntry {
                            identity: identity.to_string(),
                            embedding,
                        });
                    }
                    Ok(None) => {
                        tracing::warn!(identity, path = %image_path.display(), "no face found, skipping");
                    }
                    Err(e) => {
                        tracing::warn!(identity, path = %image_path.display(), error = %e, "skipping gallery image");
                    }
                }
            }
        }

        let gallery = Self { entries };
        tracing::info!(
            root = %root.display(),
            samples = gallery.len(),
            identities = gallery.identities().len(),
            "face gallery loaded"
        );
        Ok(gallery)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct identities, sorted.
    pub fn identities(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.iter().map(|e| e.identity.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Nearest entry by Euclidean distance. Every entry is compared.
    pub fn nearest(&self, probe: &Embedding) -> Option<GalleryMatch> {
        self.entries
            .iter()
            .map(|e| (e, probe.euclidean_distance(&e.embedding)))
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(entry, distance)| GalleryMatch {
                identity: entry.identity.clone(),
                distance,
            })
    }
}

fn enroll_image<B: FaceBackend>(
    path: &Path,
    backend: &mut B,
) -> Result<Option<Embedding>, Box<dyn std::error::Error + Send + Sync>> {
    let image = image::open(path)?.to_luma8();
    let mut encodings = backend.encodings(&image)?;
    Ok((!encodings.is_empty()).then(|| encodings.swap_remove(0)))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

fn has_gallery_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| GALLERY_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::ScriptedBackend;
    use image::{GrayImage, Luma};

    fn entry(identity: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            identity: identity.to_string(),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    #[test]
    fn test_nearest_scans_every_entry() {
        let gallery = FaceGallery::from_entries(vec![
            entry("alice", &[0.0, 1.0]),
            entry("bob", &[5.0, 5.0]),
            entry("carol", &[1.0, 0.0]),
        ]);
        let m = gallery.nearest(&Embedding::new(vec![0.9, 0.0])).unwrap();
        assert_eq!(m.identity, "carol");
        assert!((m.distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_on_empty_gallery() {
        assert!(FaceGallery::default().nearest(&Embedding::new(vec![0.0])).is_none());
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let root = tempfile::tempdir().unwrap();
        let alice = root.path().join("alice");
        let bob = root.path().join("bob");
        std::fs::create_dir_all(&alice).unwrap();
        std::fs::create_dir_all(&bob).unwrap();

        let img = GrayImage::from_pixel(8, 8, Luma([100]));
        img.save(alice.join("1.png")).unwrap();
        img.save(alice.join("2.JPG")).unwrap();
        std::fs::write(alice.join("notes.txt"), "x").unwrap();
        std::fs::write(bob.join("broken.png"), "not an image").unwrap();
        img.save(bob.join("ok.png")).unwrap();
        std::fs::write(root.path().join("stray.png"), "x").unwrap();

        let mut backend = ScriptedBackend::constant(Vec::new(), vec![Embedding::new(vec![1.0, 2.0])]);
        let gallery = FaceGallery::load_dir(root.path(), &mut backend).unwrap();

        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery.identities(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_load_dir_skips_faceless_images() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("dave");
        std::fs::create_dir_all(&dir).unwrap();
        GrayImage::from_pixel(8, 8, Luma([0])).save(dir.join("empty.png")).unwrap();

        let mut backend = ScriptedBackend::constant(Vec::new(), Vec::new());
        let gallery = FaceGallery::load_dir(root.path(), &mut backend).unwrap();
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_unreadable_identity_dir_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let alice = root.path().join("alice");
        let locked = root.path().join("locked");
        std::fs::create_dir_all(&alice).unwrap();
        std::fs::create_dir_all(&locked).unwrap();
        GrayImage::from_pixel(8, 8, Luma([100])).save(alice.join("1.png")).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        let mut backend = ScriptedBackend::constant(Vec::new(), vec![Embedding::new(vec![1.0])]);
        let loaded = FaceGallery::load_dir(root.path(), &mut backend);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let gallery = loaded.unwrap();
        assert_eq!(gallery.identities(), vec!["alice"]);
    }

    #[test]
    fn test_missing_root_is_error() {
        let mut backend = ScriptedBackend::constant(Vec::new(), Vec::new());
        let err = FaceGallery::load_dir(Path::new("/nonexistent/gallery"), &mut backend);
        assert!(matches!(err, Err(GalleryError::Io { .. })));
    }
}
