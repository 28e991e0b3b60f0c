pub mod resolver;
pub mod ytdlp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::{FailureKind, ServiceError},
    RequesterId,
};

pub use resolver::{QueryKind, Resolution, RetryPolicy, TrackResolver};
pub use ytdlp::YtDlpService;

/// Servicio externo de búsqueda y extracción
///
/// Cada estrategia de la cascada llama a `fetch_playable` con su propio
/// perfil; el servicio no guarda estado entre llamadas.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Convierte un término libre en la mejor referencia, o `None` si no hay resultados
    async fn search(&self, term: &str) -> Result<Option<Reference>, ServiceError>;

    /// Obtiene un handle reproducible presentando el perfil indicado
    async fn fetch_playable(
        &self,
        reference: &Reference,
        profile: &StrategyProfile,
    ) -> Result<Playable, ServiceError>;

    /// Nombre del servicio
    fn service_name(&self) -> &'static str;
}

/// Lo que el transporte de voz sabe reproducir
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceHandle {
    /// URL de audio resuelta, se reproduce por HTTP
    Remote(String),
    /// Archivo temporal descargado; su dueño es quien lo tenga como `current`
    LocalFile(PathBuf),
}

impl SourceHandle {
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            SourceHandle::LocalFile(path) => Some(path),
            SourceHandle::Remote(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SourceHandle::LocalFile(_))
    }
}

/// Referencia directa a un contenido (URL de la página del video)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub uri: String,
    pub title: Option<String>,
}

impl Reference {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Resultado de una estrategia exitosa
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playable {
    pub source: SourceHandle,
    pub title: String,
    pub duration_ms: u64,
}

/// Representa un track resuelto; inmutable una vez creado
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    title: String,
    source: SourceHandle,
    duration_ms: u64,
    requester: RequesterId,
    resolved_via: String,
    page_url: Option<String>,
    requested_at: DateTime<Utc>,
}

impl Track {
    pub fn new(
        title: impl Into<String>,
        source: SourceHandle,
        requester: RequesterId,
        resolved_via: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            source,
            duration_ms: 0,
            requester,
            resolved_via: resolved_via.into(),
            page_url: None,
            requested_at: Utc::now(),
        }
    }

    // Getters
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn source(&self) -> &SourceHandle {
        &self.source
    }
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_ms > 0).then(|| Duration::from_millis(self.duration_ms))
    }
    pub fn requester(&self) -> RequesterId {
        self.requester
    }
    pub fn resolved_via(&self) -> &str {
        &self.resolved_via
    }
    pub fn page_url(&self) -> Option<&str> {
        self.page_url.as_deref()
    }
    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    // Setters
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }
}

/// Perfil de identidad de cliente presentado al servicio externo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyProfile {
    pub name: String,
    pub player_client: String,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    /// Descargar el audio localmente antes de reproducir
    pub materialize: bool,
}

impl StrategyProfile {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        let name = name.into();
        Self {
            player_client: name.clone(),
            user_agent: None,
            name,
            timeout,
            materialize: false,
        }
    }

    /// Perfil con el user agent que corresponde al cliente de YouTube indicado
    pub fn persona(player_client: &str, timeout: Duration, materialize: bool) -> Self {
        let user_agent = match player_client {
            "android" | "android_embedded" | "android_creator" => Some(
                "Mozilla/5.0 (Linux; Android 11; SM-A515F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
            ),
            "ios" => Some("Mozilla/5.0 (iPad; CPU OS 14_0 like Mac OS X)"),
            "web" | "web_embedded" => Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            ),
            _ => None,
        };

        Self {
            name: player_client.to_string(),
            player_client: player_client.to_string(),
            user_agent: user_agent.map(str::to_string),
            timeout,
            materialize,
        }
    }
}

/// Clasifica el mensaje de error del extractor
pub fn classify_failure(message: &str) -> FailureKind {
    let msg = message.to_lowercase();

    // La restricción de edad también pide "sign in to confirm"
    let unavailable = [
        "confirm your age",
        "age-restricted",
        "age restricted",
        "inappropriate for some users",
        "private video",
        "not available in your country",
        "blocked it in your country",
        "video unavailable",
        "has been removed",
        "members-only",
        "this video is not available",
    ];
    if unavailable.iter().any(|p| msg.contains(p)) {
        return FailureKind::ContentUnavailable;
    }

    let denied = [
        "sign in to confirm",
        "not a bot",
        "captcha",
        "http error 403",
        "http error 429",
        "too many requests",
        "forbidden",
    ];
    if denied.iter().any(|p| msg.contains(p)) {
        return FailureKind::AccessDenied;
    }

    let transient = [
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporary failure",
        "network is unreachable",
        "unable to download webpage",
        "incomplete read",
        "http error 5",
    ];
    if transient.iter().any(|p| msg.contains(p)) {
        return FailureKind::Transient;
    }

    FailureKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bot_detection_as_access_denied() {
        assert_eq!(
            classify_failure("ERROR: [youtube] abc: Sign in to confirm you’re not a bot"),
            FailureKind::AccessDenied
        );
        assert_eq!(
            classify_failure("HTTP Error 429: Too Many Requests"),
            FailureKind::AccessDenied
        );
    }

    #[test]
    fn test_classify_content_unavailable() {
        assert_eq!(
            classify_failure("ERROR: Private video. Sign in if you've been granted access"),
            FailureKind::ContentUnavailable
        );
        assert_eq!(
            classify_failure("The uploader has not made this video available in your country; blocked it in your country"),
            FailureKind::ContentUnavailable
        );
        assert_eq!(
            classify_failure("Video unavailable. This video has been removed by the uploader"),
            FailureKind::ContentUnavailable
        );
    }

    #[test]
    fn test_classify_age_gate_as_content_unavailable() {
        assert_eq!(
            classify_failure(
                "ERROR: [youtube] abc: Sign in to confirm your age. This video may be inappropriate for some users."
            ),
            FailureKind::ContentUnavailable
        );
    }

    #[test]
    fn test_classify_transient_and_other() {
        assert_eq!(
            classify_failure("Unable to download webpage: The read operation timed out"),
            FailureKind::Transient
        );
        assert_eq!(classify_failure("Unsupported URL: ftp://x"), FailureKind::Other);
    }

    #[test]
    fn test_persona_user_agents() {
        let android = StrategyProfile::persona("android_embedded", Duration::from_secs(5), false);
        assert!(android.user_agent.as_deref().unwrap_or_default().contains("Android"));
        assert_eq!(android.player_client, "android_embedded");

        let tv = StrategyProfile::persona("tv_embed", Duration::from_secs(5), true);
        assert!(tv.user_agent.is_none());
        assert!(tv.materialize);
    }

    #[test]
    fn test_track_duration_unknown_is_zero() {
        let track = Track::new(
            "Song",
            SourceHandle::Remote("https://cdn.example/a.m4a".into()),
            RequesterId(7),
            "ios",
        );
        assert_eq!(track.duration_ms(), 0);
        assert!(track.duration().is_none());
        assert!(!track.source().is_local());
    }
}
