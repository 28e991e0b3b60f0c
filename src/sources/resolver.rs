//! Track Resolver: turns a query into a playable [`Track`] by walking an
//! ordered cascade of strategy profiles against the [`MetadataService`].
//!
//! Strategies are tried strictly in order and the cascade stops at the first
//! success. Transient failures are retried inside a strategy (bounded);
//! access-denied failures move on after a small random back-off; every attempt
//! observes the caller's cancellation token.

use std::{
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use regex::Regex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{MetadataService, Playable, Reference, StrategyProfile, Track};
use crate::{
    cache::SearchCache,
    error::{FailureKind, FailureReport, ResolutionError, StrategyFailure},
    RequesterId,
};

static DIRECT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://)?(www\.|m\.|music\.)?(youtube\.com/(watch\?v=|embed/|v/|shorts/)|youtu\.be/|youtube-nocookie\.com/|soundcloud\.com/)",
    )
    .expect("patrón de URL directa válido")
});

/// Política de reintentos y tiempos de la cascada
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Reintentos extra por estrategia, solo para errores transitorios
    pub max_retries: u8,
    pub retry_delay: Duration,
    /// Máximo del back-off aleatorio tras un acceso denegado
    pub jitter: Duration,
    pub search_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(750),
            search_timeout: Duration::from_secs(15),
        }
    }
}

/// Tipo de consulta recibida
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Direct(Reference),
    Search(String),
}

/// Track resuelto junto con los fallos de las estrategias anteriores
#[derive(Debug, Clone)]
pub struct Resolution {
    pub track: Track,
    pub failures: Vec<StrategyFailure>,
}

enum AttemptError {
    Cancelled,
    Failed(FailureKind, String),
}

pub struct TrackResolver {
    service: Arc<dyn MetadataService>,
    strategies: Vec<StrategyProfile>,
    policy: RetryPolicy,
    search_cache: Option<SearchCache>,
}

impl TrackResolver {
    pub fn new(
        service: Arc<dyn MetadataService>,
        strategies: Vec<StrategyProfile>,
        policy: RetryPolicy,
    ) -> Self {
        info!(
            "🎯 Resolver con {} estrategias: [{}]",
            strategies.len(),
            strategies
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            service,
            strategies,
            policy,
            search_cache: None,
        }
    }

    pub fn with_search_cache(mut self, cache: SearchCache) -> Self {
        self.search_cache = Some(cache);
        self
    }

    /// Distingue URLs conocidas de términos de búsqueda
    pub fn classify(query: &str) -> QueryKind {
        let query = query.trim();

        if DIRECT_PATTERN.is_match(query) {
            let uri = if query.starts_with("http://") || query.starts_with("https://") {
                query.to_string()
            } else {
                format!("https://{}", query)
            };
            return QueryKind::Direct(Reference::new(uri));
        }

        match Url::parse(query) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
                QueryKind::Direct(Reference::new(url.to_string()))
            }
            _ => QueryKind::Search(query.to_string()),
        }
    }

    pub async fn resolve(
        &self,
        query: &str,
        requester: RequesterId,
        cancel: &CancellationToken,
    ) -> Result<Track, ResolutionError> {
        self.resolve_detailed(query, requester, cancel)
            .await
            .map(|resolution| resolution.track)
    }

    /// Igual que [`resolve`](Self::resolve) pero conserva los fallos previos al éxito
    pub async fn resolve_detailed(
        &self,
        query: &str,
        requester: RequesterId,
        cancel: &CancellationToken,
    ) -> Result<Resolution, ResolutionError> {
        if cancel.is_cancelled() {
            return Err(ResolutionError::Cancelled);
        }
        if query.trim().is_empty() {
            return Err(ResolutionError::NotFound(String::new()));
        }

        let start_time = Instant::now();
        let reference = match Self::classify(query) {
            QueryKind::Direct(reference) => {
                debug!("🔗 Referencia directa: {}", reference.uri);
                reference
            }
            QueryKind::Search(term) => self.lookup(&term, cancel).await?,
        };

        info!("🎯 Iniciando cascada para: {}", reference.uri);
        let mut failures = Vec::new();

        for (index, profile) in self.strategies.iter().enumerate() {
            let remaining = self.strategies.len() - index - 1;
            if cancel.is_cancelled() {
                return Err(ResolutionError::Cancelled);
            }

            debug!("🔍 Intentando estrategia: {}", profile.name);
            match self.try_strategy(profile, &reference, cancel).await {
                Ok(playable) => {
                    info!(
                        "✅ Éxito con {} en {:?} ({} fallos previos)",
                        profile.name,
                        start_time.elapsed(),
                        failures.len()
                    );
                    let track = Self::build_track(playable, &reference, requester, profile);
                    return Ok(Resolution { track, failures });
                }
                Err(AttemptError::Cancelled) => {
                    info!("🛑 Resolución cancelada durante {}", profile.name);
                    return Err(ResolutionError::Cancelled);
                }
                Err(AttemptError::Failed(kind, detail)) => {
                    warn!("❌ {} falló [{}]: {}", profile.name, kind.as_str(), detail);
                    failures.push(StrategyFailure {
                        strategy: profile.name.clone(),
                        kind,
                        detail,
                    });

                    // No parecer sincronizado con el servicio
                    if kind == FailureKind::AccessDenied
                        && remaining > 0
                        && !sleep_or_cancel(cancel, self.jitter()).await
                    {
                        return Err(ResolutionError::Cancelled);
                    }
                }
            }
        }

        warn!(
            "❌ Todas las estrategias fallaron después de {:?}",
            start_time.elapsed()
        );
        Err(Self::exhausted(FailureReport(failures)))
    }

    /// Busca la mejor referencia para un término libre
    async fn lookup(
        &self,
        term: &str,
        cancel: &CancellationToken,
    ) -> Result<Reference, ResolutionError> {
        let key = SearchCache::normalize(term);
        if let Some(hit) = self.search_cache.as_ref().and_then(|c| c.get(&key)) {
            debug!("💾 Búsqueda en caché: {} → {}", term, hit.uri);
            return Ok(hit);
        }

        info!("🔍 Buscando con {}: {}", self.service.service_name(), term);
        let call = timeout(self.policy.search_timeout, self.service.search(term));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolutionError::Cancelled),
            outcome = call => outcome,
        };

        match outcome {
            Ok(Ok(Some(reference))) => {
                if let Some(cache) = &self.search_cache {
                    cache.insert(key, reference.clone());
                }
                Ok(reference)
            }
            Ok(Ok(None)) => {
                info!("📭 Sin resultados para: {}", term);
                Err(ResolutionError::NotFound(term.to_string()))
            }
            Ok(Err(e)) => {
                warn!("❌ Búsqueda falló para '{}': {}", term, e);
                Err(ResolutionError::NotFound(term.to_string()))
            }
            Err(_) => {
                warn!("⏰ Timeout en búsqueda de '{}'", term);
                Err(ResolutionError::NotFound(term.to_string()))
            }
        }
    }

    /// Intenta una estrategia con timeout y reintentos para errores transitorios
    async fn try_strategy(
        &self,
        profile: &StrategyProfile,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<Playable, AttemptError> {
        let attempts = u32::from(self.policy.max_retries) + 1;
        let mut last_error = String::from("sin intentos");

        for attempt in 1..=attempts {
            let call = timeout(profile.timeout, self.service.fetch_playable(reference, profile));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                outcome = call => outcome,
            };

            match outcome {
                Ok(Ok(playable)) => return Ok(playable),
                Ok(Err(e)) if e.kind == FailureKind::Transient => {
                    warn!(
                        "⚠️ Error transitorio en {} (intento {}/{}): {}",
                        profile.name, attempt, attempts, e.message
                    );
                    last_error = e.message;
                }
                Ok(Err(e)) => return Err(AttemptError::Failed(e.kind, e.message)),
                Err(_) => {
                    warn!(
                        "⏰ Timeout en {} (intento {}/{})",
                        profile.name, attempt, attempts
                    );
                    last_error = format!(
                        "timeout después de {}",
                        humantime::format_duration(profile.timeout)
                    );
                }
            }

            if attempt < attempts {
                let delay = self.policy.retry_delay * attempt;
                debug!("⏳ Esperando {:?} antes del siguiente intento", delay);
                if !sleep_or_cancel(cancel, delay).await {
                    return Err(AttemptError::Cancelled);
                }
            }
        }

        Err(AttemptError::Failed(FailureKind::Transient, last_error))
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.policy.jitter.as_millis() as u64;
        if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=max_ms))
        }
    }

    fn exhausted(report: FailureReport) -> ResolutionError {
        let all = |kind: FailureKind| !report.is_empty() && report.failures().iter().all(|f| f.kind == kind);

        if all(FailureKind::ContentUnavailable) {
            ResolutionError::ContentUnavailable(report)
        } else if all(FailureKind::AccessDenied) {
            ResolutionError::AccessDenied(report)
        } else {
            ResolutionError::AllStrategiesFailed(report)
        }
    }

    fn build_track(
        playable: Playable,
        reference: &Reference,
        requester: RequesterId,
        profile: &StrategyProfile,
    ) -> Track {
        let title = if !playable.title.trim().is_empty() {
            playable.title
        } else {
            reference
                .title
                .clone()
                .unwrap_or_else(|| reference.uri.clone())
        };

        Track::new(title, playable.source, requester, profile.name.clone())
            .with_duration_ms(playable.duration_ms)
            .with_page_url(reference.uri.clone())
    }
}

/// Duerme observando la cancelación; devuelve `false` si se canceló
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ServiceError,
        sources::{classify_failure, MockMetadataService, SourceHandle},
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const VIDEO: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
    const AGE_GATE: &str =
        "ERROR: [youtube] dQw4w9WgXcQ: Sign in to confirm your age. This video may be inappropriate for some users.";

    fn quick_policy(max_retries: u8) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            search_timeout: Duration::from_secs(1),
        }
    }

    fn profiles(names: &[&str]) -> Vec<StrategyProfile> {
        names
            .iter()
            .map(|n| StrategyProfile::new(*n, Duration::from_secs(1)))
            .collect()
    }

    fn playable(title: &str) -> Playable {
        Playable {
            source: SourceHandle::Remote(format!("https://cdn.example/{}.m4a", title)),
            title: title.to_string(),
            duration_ms: 212_000,
        }
    }

    fn mock_service() -> MockMetadataService {
        let mut service = MockMetadataService::new();
        service.expect_service_name().return_const("mock");
        service
    }

    #[test]
    fn test_classify_direct_and_search() {
        assert_eq!(
            TrackResolver::classify("youtu.be/dQw4w9WgXcQ"),
            QueryKind::Direct(Reference::new("https://youtu.be/dQw4w9WgXcQ"))
        );
        assert!(matches!(
            TrackResolver::classify(VIDEO),
            QueryKind::Direct(_)
        ));
        assert!(matches!(
            TrackResolver::classify("https://cdn.example.com/song.mp3"),
            QueryKind::Direct(_)
        ));
        assert_eq!(
            TrackResolver::classify("  never gonna give you up "),
            QueryKind::Search("never gonna give you up".into())
        );
    }

    #[tokio::test]
    async fn test_cascade_stops_at_first_success() {
        let mut service = mock_service();
        service
            .expect_fetch_playable()
            .withf(|_, p| p.name == "A")
            .times(1)
            .returning(|_, _| {
                Err(ServiceError::new(
                    FailureKind::AccessDenied,
                    "Sign in to confirm you're not a bot",
                ))
            });
        service
            .expect_fetch_playable()
            .withf(|_, p| p.name == "B")
            .times(1)
            .returning(|_, _| Ok(playable("B-song")));
        service
            .expect_fetch_playable()
            .withf(|_, p| p.name == "C")
            .times(0);

        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A", "B", "C"]), quick_policy(2));
        let resolution = resolver
            .resolve_detailed(VIDEO, RequesterId(1), &CancellationToken::new())
            .await
            .expect("B debería resolver");

        assert_eq!(resolution.track.resolved_via(), "B");
        assert_eq!(resolution.track.title(), "B-song");
        assert_eq!(resolution.track.page_url(), Some(VIDEO));
        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.failures[0].strategy, "A");
        assert_eq!(resolution.failures[0].kind, FailureKind::AccessDenied);
    }

    #[tokio::test]
    async fn test_all_content_unavailable_reports_content_unavailable() {
        let mut service = mock_service();
        service.expect_fetch_playable().times(2).returning(|_, _| {
            Err(ServiceError::new(classify_failure(AGE_GATE), AGE_GATE))
        });

        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A", "B"]), quick_policy(3));
        let err = resolver
            .resolve(VIDEO, RequesterId(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ResolutionError::ContentUnavailable(_)));
        assert_eq!(err.failures().len(), 2);
    }

    #[tokio::test]
    async fn test_no_jitter_after_last_strategy() {
        let mut service = mock_service();
        service.expect_fetch_playable().times(1).returning(|_, _| {
            Err(ServiceError::new(FailureKind::AccessDenied, "HTTP Error 403: Forbidden"))
        });

        let policy = RetryPolicy {
            jitter: Duration::from_secs(60),
            ..quick_policy(0)
        };
        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A"]), policy);

        let started = Instant::now();
        let err = resolver
            .resolve(VIDEO, RequesterId(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ResolutionError::AccessDenied(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_mixed_failures_report_all_strategies_failed() {
        let mut service = mock_service();
        service
            .expect_fetch_playable()
            .withf(|_, p| p.name == "A")
            .times(1)
            .returning(|_, _| Err(ServiceError::new(FailureKind::AccessDenied, "HTTP Error 403")));
        service
            .expect_fetch_playable()
            .withf(|_, p| p.name == "B")
            .times(1)
            .returning(|_, _| Err(ServiceError::new(FailureKind::Other, "Unsupported URL")));

        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A", "B"]), quick_policy(0));
        let err = resolver
            .resolve(VIDEO, RequesterId(1), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ResolutionError::AllStrategiesFailed(report) => {
                let names: Vec<_> = report.failures().iter().map(|f| f.strategy.as_str()).collect();
                assert_eq!(names, vec!["A", "B"]);
            }
            other => panic!("error inesperado: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_within_strategy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut service = mock_service();
        service.expect_fetch_playable().times(2).returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ServiceError::transient("Connection reset by peer"))
            } else {
                Ok(playable("retried"))
            }
        });

        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A"]), quick_policy(1));
        let resolution = resolver
            .resolve_detailed(VIDEO, RequesterId(1), &CancellationToken::new())
            .await
            .expect("el reintento debería funcionar");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(resolution.failures.is_empty());
    }

    #[tokio::test]
    async fn test_search_without_results_is_not_found() {
        let mut service = mock_service();
        service.expect_search().times(1).returning(|_| Ok(None));
        service.expect_fetch_playable().times(0);

        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A"]), quick_policy(0));
        let err = resolver
            .resolve("some obscure song", RequesterId(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ResolutionError::NotFound("some obscure song".into()));
    }

    #[tokio::test]
    async fn test_search_results_are_cached() {
        let mut service = mock_service();
        service
            .expect_search()
            .times(1)
            .returning(|_| Ok(Some(Reference::new(VIDEO).with_title("Rick"))));
        service
            .expect_fetch_playable()
            .times(2)
            .returning(|_, _| Ok(playable("Rick")));

        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A"]), quick_policy(0))
            .with_search_cache(SearchCache::for_searches(8, Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        resolver.resolve("Rick Astley", RequesterId(1), &cancel).await.unwrap();
        resolver.resolve("rick   astley", RequesterId(2), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_calls_service() {
        let mut service = mock_service();
        service.expect_fetch_playable().times(0);
        service.expect_search().times(0);

        let resolver = TrackResolver::new(Arc::new(service), profiles(&["A"]), quick_policy(0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = resolver.resolve(VIDEO, RequesterId(1), &cancel).await.unwrap_err();
        assert_eq!(err, ResolutionError::Cancelled);
    }

    /// Servicio lento para probar timeouts y cancelación
    struct SlowService {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl MetadataService for SlowService {
        async fn search(&self, _term: &str) -> Result<Option<Reference>, ServiceError> {
            Ok(Some(Reference::new(VIDEO)))
        }

        async fn fetch_playable(
            &self,
            _reference: &Reference,
            _profile: &StrategyProfile,
        ) -> Result<Playable, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(playable("late"))
        }

        fn service_name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_cancellation_abandons_remaining_strategies() {
        let service = Arc::new(SlowService {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
        });
        let resolver = TrackResolver::new(
            service.clone(),
            vec![
                StrategyProfile::new("A", Duration::from_secs(60)),
                StrategyProfile::new("B", Duration::from_secs(60)),
            ],
            quick_policy(0),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = resolver.resolve(VIDEO, RequesterId(1), &cancel).await.unwrap_err();

        assert_eq!(err, ResolutionError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_count_as_transient() {
        let service = Arc::new(SlowService {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
        });
        let resolver = TrackResolver::new(
            service.clone(),
            vec![StrategyProfile::new("A", Duration::from_millis(10))],
            quick_policy(1),
        );

        let err = resolver
            .resolve(VIDEO, RequesterId(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.failures()[0].kind, FailureKind::Transient);
        assert!(matches!(err, ResolutionError::AllStrategiesFailed(_)));
    }
}
