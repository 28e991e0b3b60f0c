//! # Error Taxonomy
//!
//! Typed errors surfaced by the playback core. The command gateway matches on
//! these to render user-facing replies; the core never formats messages itself.
//!
//! - [`ResolutionError`]: the query could not be turned into a playable track
//! - [`SessionError`]: the voice transport rejected or lost a session
//! - [`QueueFull`]: the per-chat playlist reached its cap
//! - [`PlaybackError`]: everything the orchestrator can return to a caller

use std::fmt;
use thiserror::Error;

/// Clasificación de un fallo devuelto por el servicio externo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Rechazo de cliente automatizado (sign-in, captcha, 403/429)
    AccessDenied,
    /// Restricción de edad, bloqueo regional, video eliminado o privado
    ContentUnavailable,
    /// Error de red o timeout; el único tipo que se reintenta
    Transient,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AccessDenied => "access-denied",
            FailureKind::ContentUnavailable => "content-unavailable",
            FailureKind::Transient => "transient",
            FailureKind::Other => "other",
        }
    }
}

/// Error de una llamada al servicio de metadata/búsqueda
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    pub kind: FailureKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }
}

/// Fallo registrado para una estrategia de la cascada
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: String,
    pub kind: FailureKind,
    pub detail: String,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.strategy, self.kind.as_str(), self.detail)
    }
}

/// Lista de fallos por estrategia, para diagnóstico
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport(pub Vec<StrategyFailure>);

impl FailureReport {
    pub fn failures(&self) -> &[StrategyFailure] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "sin estrategias configuradas");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("No se encontraron resultados para: {0}")]
    NotFound(String),

    #[error("El servicio rechazó todas las estrategias: {0}")]
    AccessDenied(FailureReport),

    #[error("Contenido no disponible (edad, región o eliminado): {0}")]
    ContentUnavailable(FailureReport),

    #[error("Todas las estrategias fallaron: {0}")]
    AllStrategiesFailed(FailureReport),

    #[error("Resolución cancelada")]
    Cancelled,
}

impl ResolutionError {
    /// Fallos por estrategia asociados al error (vacío si no hubo cascada)
    pub fn failures(&self) -> &[StrategyFailure] {
        match self {
            ResolutionError::AccessDenied(report)
            | ResolutionError::ContentUnavailable(report)
            | ResolutionError::AllStrategiesFailed(report) => report.failures(),
            ResolutionError::NotFound(_) | ResolutionError::Cancelled => &[],
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Falta la llamada o los permisos; no se reintenta en el controlador
    #[error("No se pudo unir a la llamada de voz: {0}")]
    Join(String),

    #[error("No se pudo cambiar el stream: {0}")]
    Stream(String),

    #[error("Conexión de voz perdida: {0}")]
    TransportLost(String),

    #[error("No hay ninguna sesión de voz activa")]
    NotPlaying,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("La cola está llena (máximo {max} canciones)")]
pub struct QueueFull {
    pub max: usize,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    #[error("No hay nada reproduciéndose")]
    NotPlaying,

    #[error("Reproducción abandonada tras {attempts} fallos consecutivos: {last_error}")]
    PersistentFailure { attempts: u32, last_error: String },
}
