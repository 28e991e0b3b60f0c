//! Text commands and the replies rendered for them.
//!
//! Parsing and formatting live here, away from serenity, so they can be
//! tested without a gateway connection.

use std::time::Duration;

use crate::{
    error::{PlaybackError, ResolutionError, SessionError},
    playback::{PlayOutcome, PlaybackNotice, QueueSnapshot, SkipOutcome, StopOutcome},
    sources::Track,
};

/// Máximo de entradas listadas en `queue`
pub const QUEUE_PAGE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play(String),
    Skip,
    Stop,
    Pause,
    Resume,
    Queue,
    Current,
    Help,
}

impl Command {
    /// Interpreta un mensaje; `None` si no es un comando para el bot
    pub fn parse(prefix: &str, content: &str) -> Option<Self> {
        let body = content.trim().strip_prefix(prefix)?;
        let (name, args) = match body.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (body, ""),
        };

        let command = match name.to_lowercase().as_str() {
            "play" | "p" => Command::Play(args.to_string()),
            "skip" | "s" => Command::Skip,
            "stop" => Command::Stop,
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "queue" | "q" => Command::Queue,
            "current" | "np" => Command::Current,
            "help" => Command::Help,
            _ => return None,
        };
        Some(command)
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn track_line(track: &Track) -> String {
    match track.duration() {
        Some(duration) => format!("**{}** [{}]", track.title(), format_duration(duration)),
        None => format!("**{}**", track.title()),
    }
}

pub fn render_play(outcome: &PlayOutcome) -> String {
    match outcome {
        PlayOutcome::Started(track) => format!("▶️ Reproduciendo: {}", track_line(track)),
        PlayOutcome::Queued { track, position } => {
            format!("➕ Agregado a la cola (#{}): {}", position, track_line(track))
        }
    }
}

pub fn render_skip(outcome: &SkipOutcome) -> String {
    match outcome {
        SkipOutcome::Next(track) => format!("⏭️ Saltada. Ahora suena: {}", track_line(track)),
        SkipOutcome::QueueEmpty => {
            "⏭️ No hay más canciones en la cola, saliendo del canal".to_string()
        }
    }
}

pub fn render_stop(outcome: &StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::Stopped => "⏹️ Reproducción detenida y cola limpiada",
        StopOutcome::AlreadyIdle => "ℹ️ No había nada reproduciéndose",
    }
}

/// Mensaje corto para el chat; el detalle por estrategia queda en los logs
pub fn render_error(error: &PlaybackError) -> String {
    match error {
        PlaybackError::Resolution(ResolutionError::NotFound(query)) => {
            format!("❌ No se encontraron resultados para: **{}**", query)
        }
        PlaybackError::Resolution(ResolutionError::ContentUnavailable(_)) => {
            "🔒 Ese contenido no está disponible (restricción de edad, región o eliminado)".to_string()
        }
        PlaybackError::Resolution(ResolutionError::AccessDenied(report)) => format!(
            "🚫 El servicio bloqueó las {} estrategias de acceso, intenta más tarde",
            report.len()
        ),
        PlaybackError::Resolution(ResolutionError::AllStrategiesFailed(report)) => format!(
            "❌ No se pudo obtener el audio (fallaron {} estrategias)",
            report.len()
        ),
        PlaybackError::Resolution(ResolutionError::Cancelled) => {
            "ℹ️ La búsqueda se canceló".to_string()
        }
        PlaybackError::Session(SessionError::NotPlaying) | PlaybackError::NotPlaying => {
            "❌ No hay nada reproduciéndose".to_string()
        }
        PlaybackError::Session(e) => format!("🔌 {}", e),
        PlaybackError::QueueFull(e) => format!("📋 {}", e),
        PlaybackError::PersistentFailure { attempts, .. } => format!(
            "⚠️ Se abandonó la cola tras {} fallos consecutivos",
            attempts
        ),
    }
}

pub fn render_current(track: Option<&Track>) -> String {
    match track {
        Some(track) => format!(
            "🎵 Reproduciendo ahora: {}\n👤 Pedido por <@{}> a las {} UTC",
            track_line(track),
            track.requester(),
            track.requested_at().format("%H:%M")
        ),
        None => "ℹ️ No hay nada reproduciéndose".to_string(),
    }
}

pub fn render_queue(snapshot: &QueueSnapshot) -> String {
    if snapshot.is_empty() {
        return "📋 La cola está vacía".to_string();
    }

    let mut lines = Vec::with_capacity(QUEUE_PAGE + 3);
    match &snapshot.current {
        Some(track) => lines.push(format!("🎵 Ahora ({}): {}", snapshot.status, track_line(track))),
        None => lines.push(format!("⏳ Estado: {}", snapshot.status)),
    }

    for (index, track) in snapshot.upcoming.iter().take(QUEUE_PAGE).enumerate() {
        lines.push(format!("{}. {}", index + 1, track_line(track)));
    }

    if snapshot.upcoming.len() > QUEUE_PAGE {
        lines.push(format!(
            "... y {} más",
            snapshot.upcoming.len() - QUEUE_PAGE
        ));
    }

    let total = snapshot.total_duration_ms();
    if total > 0 {
        lines.push(format!(
            "⏱️ Duración total: {}",
            format_duration(Duration::from_millis(total))
        ));
    }

    lines.join("\n")
}

pub fn render_notice(notice: &PlaybackNotice) -> String {
    match notice {
        PlaybackNotice::NowPlaying { track, .. } => {
            format!("▶️ Reproduciendo: {}", track_line(track))
        }
        PlaybackNotice::TrackFailed { title, .. } => {
            format!("⚠️ No se pudo reproducir **{}**, pasando a la siguiente", title)
        }
        PlaybackNotice::QueueFinished { .. } => "✅ Cola terminada, saliendo del canal".to_string(),
        PlaybackNotice::PersistentFailure { attempts, .. } => format!(
            "🛑 {} fallos seguidos de reproducción, cola vaciada",
            attempts
        ),
    }
}

pub fn help_text(prefix: &str) -> String {
    [
        ("play <búsqueda o URL>", "Reproduce o agrega a la cola"),
        ("skip", "Salta la canción actual"),
        ("stop", "Detiene y limpia la cola"),
        ("pause", "Pausa la reproducción"),
        ("resume", "Reanuda la reproducción"),
        ("queue", "Muestra la cola"),
        ("current", "Muestra lo que suena ahora"),
    ]
    .iter()
    .map(|(usage, description)| format!("`{}{}` - {}", prefix, usage, description))
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{FailureKind, FailureReport, QueueFull, StrategyFailure},
        playback::PlaybackStatus,
        sources::SourceHandle,
        ChatId, RequesterId,
    };
    use pretty_assertions::assert_eq;

    fn track(title: &str, duration_ms: u64) -> Track {
        Track::new(
            title,
            SourceHandle::Remote(format!("https://cdn.example/{}", title)),
            RequesterId(7),
            "ios",
        )
        .with_duration_ms(duration_ms)
    }

    #[test]
    fn test_parse_commands_and_aliases() {
        assert_eq!(
            Command::parse("!", "!play  never gonna give you up "),
            Some(Command::Play("never gonna give you up".into()))
        );
        assert_eq!(Command::parse("!", "!P https://youtu.be/x"), Some(Command::Play("https://youtu.be/x".into())));
        assert_eq!(Command::parse("!", "!play"), Some(Command::Play(String::new())));
        assert_eq!(Command::parse("!", "!np"), Some(Command::Current));
        assert_eq!(Command::parse("!", "!q"), Some(Command::Queue));
        assert_eq!(Command::parse("!", "!unknown"), None);
        assert_eq!(Command::parse("!", "play sin prefijo"), None);
        assert_eq!(Command::parse("m!", "m!skip"), Some(Command::Skip));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(65)), "1:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn test_queue_lists_ten_and_summarizes_rest() {
        let snapshot = QueueSnapshot {
            status: PlaybackStatus::Playing,
            current: Some(track("actual", 60_000)),
            upcoming: (1..=13).map(|i| track(&format!("t{}", i), 0)).collect(),
        };

        let text = render_queue(&snapshot);
        assert!(text.contains("10. **t10**"));
        assert!(!text.contains("**t11**"));
        assert!(text.contains("... y 3 más"));
        assert!(text.contains("Ahora (reproduciendo): **actual** [1:00]"));
    }

    #[test]
    fn test_skip_reply_names_next_track() {
        let reply = render_skip(&SkipOutcome::Next(track("c", 125_000)));
        assert_eq!(reply, "⏭️ Saltada. Ahora suena: **c** [2:05]");
    }

    #[test]
    fn test_empty_queue() {
        assert_eq!(render_queue(&QueueSnapshot::idle()), "📋 La cola está vacía");
    }

    #[test]
    fn test_play_reply_carries_position() {
        let reply = render_play(&PlayOutcome::Queued {
            track: track("b", 0),
            position: 2,
        });
        assert_eq!(reply, "➕ Agregado a la cola (#2): **b**");
    }

    #[test]
    fn test_errors_render_without_strategy_detail() {
        let report = FailureReport(vec![StrategyFailure {
            strategy: "ios".into(),
            kind: FailureKind::Transient,
            detail: "connection reset by peer".into(),
        }]);
        let text = render_error(&PlaybackError::Resolution(
            ResolutionError::AllStrategiesFailed(report),
        ));
        assert!(text.contains("1 estrategias"));
        assert!(!text.contains("connection reset"));

        let full = render_error(&PlaybackError::QueueFull(QueueFull { max: 100 }));
        assert!(full.contains("100"));
    }

    #[test]
    fn test_notice_rendering() {
        let notice = PlaybackNotice::PersistentFailure {
            chat_id: ChatId(1),
            attempts: 5,
            last_error: "boom".into(),
        };
        assert_eq!(
            render_notice(&notice),
            "🛑 5 fallos seguidos de reproducción, cola vaciada"
        );
    }

    #[test]
    fn test_current_names_requester_and_time() {
        let current = track("actual", 60_000);
        let text = render_current(Some(&current));
        assert!(text.contains("**actual** [1:00]"));
        assert!(text.contains("<@7>"));
        assert!(text.ends_with(&format!("a las {} UTC", current.requested_at().format("%H:%M"))));
        assert_eq!(render_current(None), "ℹ️ No hay nada reproduciéndose");
    }

    #[test]
    fn test_help_uses_prefix() {
        assert!(help_text("?").contains("`?skip`"));
    }
}
