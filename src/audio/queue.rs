use std::collections::VecDeque;
use tracing::{debug, info};

use crate::{error::QueueFull, sources::Track};

/// Cola FIFO de tracks pendientes de un chat
///
/// No incluye el track actual; ese vive en el estado de reproducción.
#[derive(Debug, Clone)]
pub struct Playlist {
    items: VecDeque<Track>,
    max_size: usize,
}

impl Playlist {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un track al final y devuelve su posición (1 = siguiente en sonar)
    pub fn enqueue(&mut self, track: Track) -> Result<usize, QueueFull> {
        if self.items.len() >= self.max_size {
            return Err(QueueFull { max: self.max_size });
        }

        info!("➕ Agregado a la cola: {}", track.title());
        self.items.push_back(track);
        Ok(self.items.len())
    }

    /// Obtiene el siguiente track (FIFO - First In, First Out)
    pub fn dequeue_front(&mut self) -> Option<Track> {
        let next = self.items.pop_front();
        match &next {
            Some(track) => debug!("➡️ Siguiente en cola (FIFO): {}", track.title()),
            None => debug!("📭 Cola vacía, no hay siguiente track"),
        }
        next
    }

    /// Vacía la cola y devuelve los tracks descartados
    pub fn clear(&mut self) -> Vec<Track> {
        let drained: Vec<Track> = self.items.drain(..).collect();
        if !drained.is_empty() {
            info!("🗑️ Cola limpiada ({} canciones)", drained.len());
        }
        drained
    }

    pub fn snapshot(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Duración total conocida de la cola en milisegundos
    pub fn total_duration_ms(&self) -> u64 {
        self.items.iter().map(Track::duration_ms).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sources::SourceHandle, RequesterId};
    use pretty_assertions::assert_eq;

    fn track(title: &str) -> Track {
        Track::new(
            title,
            SourceHandle::Remote(format!("https://cdn.example/{}", title)),
            RequesterId(1),
            "ios",
        )
        .with_duration_ms(1_000)
    }

    fn titles(playlist: &Playlist) -> Vec<String> {
        playlist
            .snapshot()
            .iter()
            .map(|t| t.title().to_string())
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut playlist = Playlist::new(10);
        assert_eq!(playlist.enqueue(track("a")), Ok(1));
        assert_eq!(playlist.enqueue(track("b")), Ok(2));

        assert_eq!(playlist.dequeue_front().map(|t| t.title().to_string()), Some("a".into()));
        assert_eq!(playlist.enqueue(track("c")), Ok(2));
        assert_eq!(titles(&playlist), vec!["b", "c"]);
    }

    #[test]
    fn test_enqueue_rejected_when_full() {
        let mut playlist = Playlist::new(2);
        playlist.enqueue(track("a")).unwrap();
        playlist.enqueue(track("b")).unwrap();

        assert_eq!(playlist.enqueue(track("c")), Err(QueueFull { max: 2 }));
        assert_eq!(playlist.len(), 2);
    }

    #[test]
    fn test_duplicates_allowed_and_clear_returns_items() {
        let mut playlist = Playlist::new(5);
        playlist.enqueue(track("a")).unwrap();
        playlist.enqueue(track("a")).unwrap();
        assert_eq!(playlist.total_duration_ms(), 2_000);

        let drained = playlist.clear();
        assert_eq!(drained.len(), 2);
        assert!(playlist.is_empty());
        assert!(playlist.dequeue_front().is_none());
    }
}
