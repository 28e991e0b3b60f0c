use chrono::Utc;
use std::{
    io,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::sources::Track;

/// Directorio temporal para audio descargado
///
/// El directorio entero se borra al soltar el store (salida del proceso). Los
/// archivos individuales se liberan en cuanto el track deja de ser `current` o
/// se descarta de la cola.
#[derive(Debug)]
pub struct ArtifactStore {
    root: TempDir,
}

impl ArtifactStore {
    pub fn new(parent: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("voicechat-music-");

        let root = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        info!("💾 Directorio de audio temporal: {}", root.path().display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Ruta sin extensión para la próxima descarga
    pub fn next_path_stem(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        self.root
            .path()
            .join(format!("{}-{:016x}", stamp, fastrand::u64(..)))
    }

    /// Reserva una ruta para una descarga que todavía puede fallar
    pub fn pending(&self) -> PendingArtifact<'_> {
        PendingArtifact {
            store: self,
            stem: self.next_path_stem(),
            kept: false,
        }
    }

    /// Borra todo archivo cuyo nombre empiece con el stem (la extensión la elige yt-dlp)
    fn discard_stem(&self, stem: &Path) -> usize {
        let Some(prefix) = stem.file_name().and_then(|n| n.to_str()) else {
            return 0;
        };
        let Ok(entries) = std::fs::read_dir(self.root.path()) else {
            return 0;
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_str().is_some_and(|n| n.starts_with(prefix)))
            .filter(|entry| match std::fs::remove_file(entry.path()) {
                Ok(()) => true,
                Err(e) => {
                    warn!("⚠️ No se pudo borrar {}: {}", entry.path().display(), e);
                    false
                }
            })
            .count()
    }

    /// Solo se borran archivos dentro del directorio propio
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(self.root.path()) && path != self.root.path()
    }

    /// Borra el archivo local del track, si lo tiene. Devuelve si se borró algo.
    pub async fn release(&self, track: &Track) -> bool {
        let Some(path) = track.source().local_path() else {
            return false;
        };

        if !self.owns(path) {
            warn!("⚠️ Ignorando archivo fuera del directorio temporal: {}", path.display());
            return false;
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("🗑️ Archivo liberado: {}", path.display());
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("⚠️ No se pudo borrar {}: {}", path.display(), e);
                false
            }
        }
    }

    pub async fn release_all<'a>(&self, tracks: impl IntoIterator<Item = &'a Track>) -> usize {
        let mut released = 0;
        for track in tracks {
            if self.release(track).await {
                released += 1;
            }
        }
        released
    }

    /// Número de archivos presentes en el directorio
    pub fn count(&self) -> usize {
        std::fs::read_dir(self.root.path())
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }
}

/// Descarga en curso dentro del store
///
/// Si no se confirma con [`keep`](Self::keep), al soltarla se borra lo que se
/// haya escrito con su stem, así un intento fallido o cancelado no deja basura.
pub struct PendingArtifact<'a> {
    store: &'a ArtifactStore,
    stem: PathBuf,
    kept: bool,
}

impl PendingArtifact<'_> {
    pub fn stem(&self) -> &Path {
        &self.stem
    }

    /// El archivo pasa a pertenecer al track que lo usa
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for PendingArtifact<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        let removed = self.store.discard_stem(&self.stem);
        if removed > 0 {
            debug!("🗑️ Descarga incompleta descartada: {}", self.stem.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sources::SourceHandle, RequesterId};

    fn local_track(path: PathBuf) -> Track {
        Track::new("song", SourceHandle::LocalFile(path), RequesterId(1), "tv_embed")
    }

    #[tokio::test]
    async fn test_release_removes_owned_file_once() {
        let store = ArtifactStore::new(None).unwrap();
        let path = store.next_path_stem().with_extension("m4a");
        tokio::fs::write(&path, b"audio").await.unwrap();
        assert_eq!(store.count(), 1);

        let track = local_track(path);
        assert!(store.release(&track).await);
        assert!(!store.release(&track).await);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_release_ignores_foreign_and_remote() {
        let store = ArtifactStore::new(None).unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();

        assert!(!store.release(&local_track(outside.path().to_path_buf())).await);
        assert!(outside.path().exists());

        let remote = Track::new(
            "song",
            SourceHandle::Remote("https://cdn.example/a.m4a".into()),
            RequesterId(1),
            "ios",
        );
        assert!(!store.release(&remote).await);
    }

    #[test]
    fn test_path_stems_are_unique() {
        let store = ArtifactStore::new(None).unwrap();
        let a = store.next_path_stem();
        let b = store.next_path_stem();
        assert_ne!(a, b);
        assert!(store.owns(&a));
    }

    #[test]
    fn test_pending_artifact_discarded_unless_kept() {
        let store = ArtifactStore::new(None).unwrap();

        let failed = store.pending();
        std::fs::write(failed.stem().with_extension("m4a"), b"partial").unwrap();
        std::fs::write(failed.stem().with_extension("webm"), b"partial").unwrap();
        let survivor = store.next_path_stem().with_extension("m4a");
        std::fs::write(&survivor, b"audio").unwrap();
        assert_eq!(store.count(), 3);

        drop(failed);
        assert_eq!(store.count(), 1);
        assert!(survivor.exists());

        let done = store.pending();
        let path = done.stem().with_extension("m4a");
        std::fs::write(&path, b"audio").unwrap();
        done.keep();
        assert!(path.exists());
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_root_removed_on_drop() {
        let store = ArtifactStore::new(None).unwrap();
        let root = store.root().to_path_buf();
        assert!(root.exists());
        drop(store);
        assert!(!root.exists());
    }
}
