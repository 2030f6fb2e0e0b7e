use std::path::PathBuf;

use rand::Rng;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use crate::{
    extractor::ClientIdentity,
    normalize::CanonicalUrl,
    retrieval::{FormatTarget, RetrievalError, Retriever},
};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// `base * 2^retry`, without jitter. Retry indices start at 1.
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
    }

    /// Jitter stays below half the base delay, so consecutive delays keep
    /// growing strictly.
    pub fn delay_for(&self, retry: usize) -> Duration {
        let max_jitter_ms = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter_ms = if max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..max_jitter_ms)
        };
        self.backoff(retry)
            .saturating_add(Duration::from_millis(jitter_ms))
    }
}

/// Which phrasing and client identity attempt `attempt` uses. Depends only on
/// the attempt index.
pub fn plan_attempt(attempt: usize, target: &FormatTarget) -> (FormatTarget, ClientIdentity) {
    match attempt {
        0 => (target.clone(), ClientIdentity::Default),
        1 => (target.alternate(), ClientIdentity::Default),
        _ => (target.clone(), ClientIdentity::Mobile),
    }
}

pub struct RetryOrchestrator {
    retriever: Retriever,
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(retriever: Retriever, policy: RetryPolicy) -> Self {
        Self { retriever, policy }
    }

    pub async fn retrieve_with_retry(
        &self,
        url: &CanonicalUrl,
        target: &FormatTarget,
    ) -> Result<PathBuf, RetrievalError> {
        let mut attempt = 0;

        loop {
            let (phrasing, client) = plan_attempt(attempt, target);
            if attempt > 0 {
                info!(
                    "Retry {attempt}/{} for {url} with {:?} as {client} client",
                    self.policy.max_attempts - 1,
                    phrasing
                );
            }

            match self.retriever.retrieve(url, &phrasing, client).await {
                Ok(path) => return Ok(path),
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts || !error.cause().is_retryable() {
                        return Err(RetrievalError::Exhausted {
                            attempts: attempt,
                            last: Box::new(error),
                        });
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "Attempt {attempt} for {url} failed: {error}. Sleeping {}ms",
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        extractor::ExtractorError,
        normalize::normalize,
        retrieval::StrategyFailure,
        testing::{FakeExtractor, FakeRemuxer, FetchStep},
    };

    fn orchestrator(extractor: Arc<FakeExtractor>, dir: &tempfile::TempDir) -> RetryOrchestrator {
        RetryOrchestrator::new(
            Retriever::new(extractor, Arc::new(FakeRemuxer::succeeding()), dir.path()),
            RetryPolicy::new(3, Duration::from_secs(1)),
        )
    }

    #[test]
    fn backoff_grows_strictly_even_with_jitter() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        for _ in 0..64 {
            let delays: Vec<_> = (1..5).map(|retry| policy.delay_for(retry)).collect();
            assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "{delays:?}");
            assert!(delays[0] < Duration::from_millis(1_250));
        }
    }

    #[test]
    fn attempts_vary_phrasing_then_client() {
        let target = FormatTarget::Height(720);
        assert_eq!(plan_attempt(0, &target), (target.clone(), ClientIdentity::Default));
        assert_eq!(
            plan_attempt(1, &target),
            (target.alternate(), ClientIdentity::Default)
        );
        assert_eq!(plan_attempt(2, &target), (target.clone(), ClientIdentity::Mobile));
        assert_eq!(plan_attempt(7, &target).1, ClientIdentity::Mobile);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_extractor_exhausts_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Arc::new(
            FakeExtractor::new()
                .otherwise(FetchStep::fail(|| ExtractorError::Network("connection reset".into()))),
        );
        let orchestrator = orchestrator(extractor.clone(), &dir);

        let error = orchestrator
            .retrieve_with_retry(
                &normalize("https://youtu.be/ABCDEFGHIJK"),
                &FormatTarget::Height(720),
            )
            .await
            .unwrap_err();

        match &error {
            RetrievalError::Exhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, RetrievalError::StrategiesFailed { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            error.cause(),
            StrategyFailure::Extractor(ExtractorError::Network(_))
        ));
        assert!(error.to_string().contains("connection reset"));

        // Each attempt runs combined-mux then single-stream.
        let requests = extractor.requests();
        assert_eq!(requests.len(), 6);
        assert_eq!(
            requests[2].expression,
            FormatTarget::Height(720).alternate().combined_expression()
        );
        assert_eq!(requests[4].client, ClientIdentity::Mobile);

        let times = extractor.fetch_times();
        assert_eq!(times[0], times[1]);
        let first_delay = times[2] - times[1];
        let second_delay = times[4] - times[3];
        assert!(first_delay >= Duration::from_secs(2));
        assert!(second_delay > first_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_tool_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Arc::new(
            FakeExtractor::new()
                .otherwise(FetchStep::fail(|| ExtractorError::ToolMissing("yt-dlp".into()))),
        );

        let error = orchestrator(extractor.clone(), &dir)
            .retrieve_with_retry(&normalize("https://youtu.be/ABCDEFGHIJK"), &FormatTarget::Best)
            .await
            .unwrap_err();

        assert!(matches!(error, RetrievalError::Exhausted { attempts: 1, .. }));
        assert_eq!(extractor.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn alternate_phrasing_keeps_height_ceiling_on_separate_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Arc::new(
            FakeExtractor::new()
                .then(FetchStep::fail(|| ExtractorError::Network("connection reset".into())))
                .then(FetchStep::fail(|| ExtractorError::Network("connection reset".into())))
                .then(FetchStep::fail(|| ExtractorError::Merge("ffmpeg exited".into())))
                .then(FetchStep::write("mp4", b"video"))
                .then(FetchStep::write("m4a", b"audio")),
        );

        let path = orchestrator(extractor.clone(), &dir)
            .retrieve_with_retry(
                &normalize("https://youtu.be/ABCDEFGHIJK"),
                &FormatTarget::Height(720),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"videoaudio");
        let requests = extractor.requests();
        assert_eq!(requests.len(), 5);
        assert_eq!(
            requests[2].expression,
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
        assert_eq!(
            requests[3].expression,
            "bestvideo[height<=720]/best[height<=720]"
        );
        assert_eq!(requests[3].client, ClientIdentity::Default);
        assert!(requests[4].expression.starts_with("bestaudio"));
    }

    #[tokio::test(start_paused = true)]
    async fn later_attempt_can_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = Arc::new(
            FakeExtractor::new()
                .then(FetchStep::fail(|| ExtractorError::Blocked("HTTP Error 429".into())))
                .then(FetchStep::fail(|| ExtractorError::Blocked("HTTP Error 429".into())))
                .then(FetchStep::write("mp4", b"second attempt")),
        );

        let path = orchestrator(extractor.clone(), &dir)
            .retrieve_with_retry(&normalize("https://youtu.be/ABCDEFGHIJK"), &FormatTarget::Best)
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"second attempt");
        assert_eq!(
            extractor.requests()[2].expression,
            "bestvideo+bestaudio/best"
        );
    }
}
