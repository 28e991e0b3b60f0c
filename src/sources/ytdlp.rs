use anyhow::{Context, Result};
use async_process::{Command, Output};
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{classify_failure, MetadataService, Playable, Reference, SourceHandle, StrategyProfile};
use crate::{
    audio::artifacts::ArtifactStore,
    error::{FailureKind, ServiceError},
};

/// Formatos que symphonia decodifica sin ffmpeg
const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio[ext=mp3]/bestaudio/best";

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    url: Option<String>,
    webpage_url: Option<String>,
}

/// Servicio de metadata/extracción basado en el binario yt-dlp
///
/// Cada llamada es un subproceso independiente; el perfil de la estrategia se
/// traduce a `--extractor-args youtube:player_client=...` y `--user-agent`.
pub struct YtDlpService {
    binary: PathBuf,
    cookies: Option<PathBuf>,
    artifacts: Arc<ArtifactStore>,
    // Limitar subprocesos concurrentes para evitar rate limiting
    rate_limiter: Semaphore,
}

impl YtDlpService {
    pub fn new(binary: impl Into<PathBuf>, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            binary: binary.into(),
            cookies: None,
            artifacts,
            rate_limiter: Semaphore::new(3),
        }
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn cookies(&self) -> Option<&Path> {
        self.cookies.as_deref()
    }

    /// Verifica que yt-dlp esté disponible y devuelve su versión
    pub async fn check_version(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("yt-dlp no encontrado en {}", self.binary.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "yt-dlp --version falló: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("✅ yt-dlp versión: {}", version);
        Ok(version)
    }

    /// Busca archivo de cookies disponible
    pub async fn find_cookies_file() -> Option<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(PathBuf::from(home).join(".config/yt-dlp/cookies.txt"));
        }
        candidates.push(PathBuf::from("/app/.config/yt-dlp/cookies.txt"));
        candidates.push(PathBuf::from("./cookies.txt"));

        for path in candidates {
            if tokio::fs::metadata(&path).await.is_ok() {
                info!("🍪 Cookies encontradas en: {}", path.display());
                return Some(path);
            }
        }

        warn!("🍪 No se encontraron cookies - algunos videos pueden pedir verificación");
        None
    }

    fn command(&self, profile: Option<&StrategyProfile>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd.args(["--no-warnings", "--no-playlist", "--socket-timeout", "15"]);

        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }

        if let Some(profile) = profile {
            cmd.arg("--extractor-args")
                .arg(format!("youtube:player_client={}", profile.player_client));
            if let Some(user_agent) = &profile.user_agent {
                cmd.arg("--user-agent").arg(user_agent);
            }
        }

        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<String, ServiceError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ServiceError::new(FailureKind::Other, e.to_string()))?;

        let output: Output = cmd.output().await.map_err(|e| {
            ServiceError::new(FailureKind::Other, format!("no se pudo ejecutar yt-dlp: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = error_line(&stderr);
            return Err(ServiceError::new(classify_failure(&stderr), message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Obtiene la URL de streaming de audio sin descargar
    async fn stream_url(
        &self,
        reference: &Reference,
        profile: &StrategyProfile,
    ) -> Result<Playable, ServiceError> {
        let mut cmd = self.command(Some(profile));
        cmd.args(["--dump-single-json", "-f", AUDIO_FORMAT]);
        cmd.arg(&reference.uri);

        let stdout = self.run(cmd).await?;
        let info: YtDlpInfo = serde_json::from_str(stdout.trim()).map_err(|e| {
            ServiceError::new(FailureKind::Other, format!("respuesta de yt-dlp inválida: {}", e))
        })?;

        let url = info.url.filter(|u| !u.is_empty()).ok_or_else(|| {
            ServiceError::new(FailureKind::Other, "yt-dlp no devolvió URL de audio")
        })?;

        debug!(
            "🔗 URL de stream para {}",
            info.webpage_url.as_deref().unwrap_or(&reference.uri)
        );

        Ok(Playable {
            source: SourceHandle::Remote(url),
            title: info
                .title
                .or_else(|| reference.title.clone())
                .unwrap_or_default(),
            duration_ms: seconds_to_ms(info.duration),
        })
    }

    /// Descarga el audio al almacén de artefactos
    async fn materialize(
        &self,
        reference: &Reference,
        profile: &StrategyProfile,
    ) -> Result<Playable, ServiceError> {
        // Se descarta al salir por error, timeout o cancelación
        let pending = self.artifacts.pending();
        let template = format!("{}.%(ext)s", pending.stem().display());

        let mut cmd = self.command(Some(profile));
        cmd.args(["-f", AUDIO_FORMAT, "--no-simulate", "--no-part", "-o"]);
        cmd.arg(&template);
        cmd.args([
            "--print",
            "video:%(duration)s|%(title)s",
            "--print",
            "after_move:filepath",
        ]);
        cmd.arg(&reference.uri);

        let stdout = self.run(cmd).await?;
        let (duration_ms, title, path) = parse_materialized(&stdout).ok_or_else(|| {
            ServiceError::new(FailureKind::Other, "yt-dlp no informó el archivo descargado")
        })?;

        if !self.artifacts.owns(&path) {
            return Err(ServiceError::new(
                FailureKind::Other,
                format!("archivo fuera del directorio temporal: {}", path.display()),
            ));
        }

        pending.keep();
        info!("💾 Audio descargado: {}", path.display());
        Ok(Playable {
            source: SourceHandle::LocalFile(path),
            title: title
                .or_else(|| reference.title.clone())
                .unwrap_or_default(),
            duration_ms,
        })
    }
}

#[async_trait]
impl MetadataService for YtDlpService {
    async fn search(&self, term: &str) -> Result<Option<Reference>, ServiceError> {
        let mut cmd = self.command(None);
        cmd.args([
            "--flat-playlist",
            "--skip-download",
            "--print",
            "%(url)s|%(duration)s|%(title)s",
        ]);
        cmd.arg(format!("ytsearch1:{}", term));

        let stdout = self.run(cmd).await?;
        Ok(stdout.lines().find_map(parse_search_line))
    }

    async fn fetch_playable(
        &self,
        reference: &Reference,
        profile: &StrategyProfile,
    ) -> Result<Playable, ServiceError> {
        if profile.materialize {
            self.materialize(reference, profile).await
        } else {
            self.stream_url(reference, profile).await
        }
    }

    fn service_name(&self) -> &'static str {
        "yt-dlp"
    }
}

/// Última línea `ERROR:` de stderr, o todo stderr si no hay ninguna
fn error_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .unwrap_or_else(|| stderr.trim())
        .trim()
        .to_string()
}

fn seconds_to_ms(seconds: Option<f64>) -> u64 {
    seconds
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(|s| (s * 1000.0) as u64)
        .unwrap_or(0)
}

fn parse_seconds(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// `url|duración|título` → referencia
fn parse_search_line(line: &str) -> Option<Reference> {
    let mut parts = line.trim().splitn(3, '|');
    let url = parts.next()?.trim();
    if url.is_empty() || url == "NA" {
        return None;
    }
    let _duration = parts.next();
    let reference = Reference::new(url);

    Some(match parts.next().map(str::trim) {
        Some(title) if !title.is_empty() && title != "NA" => reference.with_title(title),
        _ => reference,
    })
}

/// Primera línea `duración|título`, última línea la ruta final del archivo
fn parse_materialized(stdout: &str) -> Option<(u64, Option<String>, PathBuf)> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let path = PathBuf::from(*lines.last()?);
    let (duration, title) = match lines.first().and_then(|l| l.split_once('|')) {
        Some((duration, title)) if lines.len() > 1 => (
            seconds_to_ms(parse_seconds(duration)),
            Some(title.trim().to_string()).filter(|t| !t.is_empty() && t != "NA"),
        ),
        _ => (0, None),
    };

    Some((duration, title, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_search_line_keeps_pipes_in_title() {
        let reference =
            parse_search_line("https://www.youtube.com/watch?v=abc|212.0|AC/DC | Live at River Plate")
                .expect("línea válida");
        assert_eq!(reference.uri, "https://www.youtube.com/watch?v=abc");
        assert_eq!(reference.title.as_deref(), Some("AC/DC | Live at River Plate"));
    }

    #[test]
    fn test_parse_search_line_rejects_missing_url() {
        assert!(parse_search_line("NA|NA|NA").is_none());
        assert!(parse_search_line("").is_none());
    }

    #[test]
    fn test_parse_materialized_output() {
        let stdout = "212.5|Never Gonna Give You Up\n/tmp/vcm-x/20261018-ab.m4a\n";
        let (duration, title, path) = parse_materialized(stdout).expect("salida válida");
        assert_eq!(duration, 212_500);
        assert_eq!(title.as_deref(), Some("Never Gonna Give You Up"));
        assert_eq!(path, PathBuf::from("/tmp/vcm-x/20261018-ab.m4a"));
    }

    #[test]
    fn test_error_line_prefers_last_error() {
        let stderr = "WARNING: something\nERROR: first\nERROR: [youtube] abc: Sign in to confirm you're not a bot\n";
        let line = error_line(stderr);
        assert!(line.contains("Sign in"));
        assert_eq!(classify_failure(&line), FailureKind::AccessDenied);
    }

    /// yt-dlp falso: escribe la descarga a medias y termina con error
    #[cfg(unix)]
    fn failing_downloader(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("yt-dlp");
        std::fs::write(
            &script,
            r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then
    shift
    out=$(printf '%s' "$1" | sed 's/%(ext)s/m4a/')
    printf 'partial' > "$out"
  fi
  shift
done
echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot" >&2
exit 1
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_download_leaves_no_artifact() {
        let bin_dir = tempfile::tempdir().unwrap();
        let binary = failing_downloader(bin_dir.path());
        let artifacts = Arc::new(ArtifactStore::new(None).unwrap());
        let service = YtDlpService::new(binary, artifacts.clone());

        let profile = StrategyProfile::persona("tv_embed", std::time::Duration::from_secs(5), true);
        let err = service
            .fetch_playable(&Reference::new("https://youtu.be/abc"), &profile)
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::AccessDenied);
        assert_eq!(artifacts.count(), 0);
    }

    #[test]
    fn test_seconds_to_ms_ignores_unknown() {
        assert_eq!(seconds_to_ms(None), 0);
        assert_eq!(seconds_to_ms(Some(f64::NAN)), 0);
        assert_eq!(seconds_to_ms(Some(1.5)), 1500);
    }
}
