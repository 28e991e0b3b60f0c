use async_trait::async_trait;
use std::fmt;
use tracing::debug;

use crate::{error::SessionError, sources::Track, ChatId};

/// Identificador opaco de una sesión de voz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Streaming,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    StreamStarted { title: String },
    StreamEnded { title: String, reason: EndReason },
    SessionLost { reason: String },
}

/// Evento del transporte, etiquetado con la generación del stream que lo produjo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub chat_id: ChatId,
    pub generation: u64,
    pub kind: SessionEventKind,
}

/// Lado emisor del canal de eventos de sesión
#[derive(Debug, Clone)]
pub struct EventSink(flume::Sender<SessionEvent>);

pub type EventStream = flume::Receiver<SessionEvent>;

impl EventSink {
    /// Devuelve `false` si ya nadie escucha
    pub fn emit(&self, event: SessionEvent) -> bool {
        debug!(
            "📡 Evento de sesión chat {} gen {}: {:?}",
            event.chat_id, event.generation, event.kind
        );
        self.0.send(event).is_ok()
    }
}

pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = flume::unbounded();
    (EventSink(tx), rx)
}

/// Controla la sesión de voz de cada chat
///
/// `generation` identifica el stream pedido; todo evento producido por ese
/// stream lleva la misma generación para que el orquestador descarte los viejos.
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Entra a la llamada y empieza el track. Si ya hay sesión equivale a `change_stream`.
    async fn join(
        &self,
        chat: ChatId,
        track: &Track,
        generation: u64,
    ) -> Result<SessionHandle, SessionError>;

    /// Reemplaza el stream de una sesión activa sin salir de la llamada
    async fn change_stream(
        &self,
        chat: ChatId,
        track: &Track,
        generation: u64,
    ) -> Result<(), SessionError>;

    async fn pause(&self, chat: ChatId) -> Result<(), SessionError>;

    async fn resume(&self, chat: ChatId) -> Result<(), SessionError>;

    /// Sale de la llamada; no falla si no había sesión
    async fn leave(&self, chat: ChatId);

    fn state(&self, chat: ChatId) -> SessionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sink_reports_closed_channel() {
        let (sink, stream) = event_channel();
        let event = SessionEvent {
            chat_id: ChatId(1),
            generation: 3,
            kind: SessionEventKind::SessionLost {
                reason: "timeout".into(),
            },
        };

        assert!(sink.emit(event.clone()));
        assert_eq!(stream.try_recv().ok(), Some(event.clone()));

        drop(stream);
        assert!(!sink.emit(event));
    }
}
