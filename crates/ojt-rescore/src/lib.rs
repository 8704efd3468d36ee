//! AI match rescoring: candidate resolution, bounded worker pool, result persistence.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ojt_core::{job_text, student_text, ScoreRecord, ScoreResult, StudentCandidate};
use ojt_oracle::{OracleError, ScoreOracle};
use ojt_storage::{MatchStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ojt-rescore";

#[derive(Debug, Clone)]
pub struct RescoreConfig {
    pub concurrency: usize,
    pub default_top_n: usize,
    pub call_timeout: Duration,
}

impl Default for RescoreConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            default_top_n: 10,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RescoreConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: std::env::var("OJT_RESCORE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|v| v.max(1))
                .unwrap_or(defaults.concurrency),
            default_top_n: std::env::var("OJT_RESCORE_DEFAULT_TOP_N")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_top_n),
            call_timeout: std::env::var("OJT_RESCORE_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_timeout),
        }
    }

    /// Whether a bounded oracle call leaves room for the client's full retry loop.
    pub fn fits_oracle_budget(&self, oracle_worst_case: Duration) -> bool {
        oracle_worst_case <= self.call_timeout
    }
}

/// Body of a rescoring request, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RescoreRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub top_n: Option<usize>,
    #[serde(default)]
    pub score_all_students: bool,
}

impl RescoreRequest {
    pub fn into_job(self, default_top_n: usize) -> Result<RescoreJob, RescoreError> {
        let job_id = self
            .job_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(RescoreError::MissingJobId)?;
        Ok(RescoreJob {
            job_id,
            top_n: self.top_n.unwrap_or(default_top_n),
            score_all_students: self.score_all_students,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescoreJob {
    pub job_id: String,
    pub top_n: usize,
    pub score_all_students: bool,
}

#[derive(Debug, Error)]
pub enum RescoreError {
    #[error("Missing job_id")]
    MissingJobId,
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("failed to load job posting: {0}")]
    JobLookup(#[source] StoreError),
    #[error("failed to resolve candidates: {0}")]
    CandidateResolution(#[source] StoreError),
    #[error("scoring worker failed: {0}")]
    Worker(#[from] JoinError),
}

/// Why one candidate ended up without a score. Never escapes the worker.
#[derive(Debug, Error)]
enum CandidateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("student profile {0} not found")]
    MissingProfile(String),
    #[error("{call} timed out after {after:?}")]
    Timeout { call: &'static str, after: Duration },
}

async fn bounded<T, E>(
    limit: Duration,
    call: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, CandidateError>
where
    CandidateError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CandidateError::from),
        Err(_) => Err(CandidateError::Timeout { call, after: limit }),
    }
}

/// Resolves which students a run scores.
#[derive(Clone)]
pub struct CandidateSource {
    store: Arc<dyn MatchStore>,
}

impl CandidateSource {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { store }
    }

    /// Every student with similarity 0, or the first `top_n` of the ranking in returned order.
    pub async fn resolve(&self, job: &RescoreJob) -> Result<Vec<StudentCandidate>, StoreError> {
        if job.score_all_students {
            let ids = self.store.student_ids().await?;
            return Ok(ids.into_iter().map(StudentCandidate::unranked).collect());
        }
        let mut ranked = self.store.ranked_students(&job.job_id).await?;
        ranked.truncate(job.top_n);
        Ok(ranked)
    }
}

/// Drains a shared FIFO queue with a fixed number of tokio tasks.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs `work` once per item with at most `concurrency` items in flight.
    /// Output order follows completion, not input.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, work: F) -> Result<Vec<R>, JoinError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = items.len();
        let workers = self.concurrency.min(total);
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let results = Arc::new(Mutex::new(Vec::with_capacity(total)));

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let work = work.clone();
            set.spawn(async move {
                let mut processed = 0usize;
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some(item) = next else { break };
                    let outcome = work(item).await;
                    results.lock().await.push(outcome);
                    processed += 1;
                }
                trace!(worker_id, processed, "worker drained queue");
            });
        }

        while let Some(joined) = set.join_next().await {
            joined?;
        }

        let mut guard = results.lock().await;
        Ok(std::mem::take(&mut *guard))
    }
}

/// Persists one row per (student, job) and produces the response record.
#[derive(Clone)]
pub struct ResultSink {
    store: Arc<dyn MatchStore>,
    call_timeout: Duration,
}

impl ResultSink {
    pub fn new(store: Arc<dyn MatchStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Upsert failures are logged; the candidate still appears in the output.
    pub async fn record(
        &self,
        candidate: &StudentCandidate,
        job_id: &str,
        gpt_score: Option<u8>,
    ) -> ScoreRecord {
        let result = ScoreResult::new(candidate, job_id, gpt_score, Utc::now());
        match tokio::time::timeout(self.call_timeout, self.store.upsert_score(&result)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(student_id = %result.student_id, error = %err, "failed to persist score")
            }
            Err(_) => {
                warn!(student_id = %result.student_id, after = ?self.call_timeout, "timed out persisting score")
            }
        }
        ScoreRecord::from(&result)
    }
}

struct ScoringContext {
    store: Arc<dyn MatchStore>,
    oracle: Arc<dyn ScoreOracle>,
    sink: ResultSink,
    job_id: String,
    job_text: String,
    call_timeout: Duration,
}

impl ScoringContext {
    async fn process(&self, candidate: StudentCandidate) -> ScoreRecord {
        let gpt_score = match self.score_candidate(&candidate).await {
            Ok(score) => {
                debug!(student_id = %candidate.student_id, score, "candidate scored");
                Some(score)
            }
            Err(err) => {
                warn!(student_id = %candidate.student_id, error = %err, "candidate left unscored");
                None
            }
        };
        self.sink.record(&candidate, &self.job_id, gpt_score).await
    }

    async fn score_candidate(&self, candidate: &StudentCandidate) -> Result<u8, CandidateError> {
        let student_id = candidate.student_id.as_str();
        let (profile, resume) = tokio::try_join!(
            bounded(
                self.call_timeout,
                "student profile fetch",
                self.store.student_profile(student_id)
            ),
            bounded(
                self.call_timeout,
                "resume fetch",
                self.store.resume_text(student_id)
            ),
        )?;
        let profile = profile.ok_or_else(|| CandidateError::MissingProfile(student_id.to_string()))?;
        let text = student_text(&profile, resume.as_deref());
        bounded(
            self.call_timeout,
            "oracle call",
            self.oracle.score(&self.job_text, &text),
        )
        .await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RescoreOutcome {
    pub run_id: Uuid,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scored: usize,
    pub unscored: usize,
    pub results: Vec<ScoreRecord>,
}

pub struct RescorePipeline {
    store: Arc<dyn MatchStore>,
    oracle: Arc<dyn ScoreOracle>,
    config: RescoreConfig,
}

impl RescorePipeline {
    pub fn new(
        store: Arc<dyn MatchStore>,
        oracle: Arc<dyn ScoreOracle>,
        config: RescoreConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            config,
        }
    }

    pub fn config(&self) -> &RescoreConfig {
        &self.config
    }

    /// Validate a raw request and run it. Validation failures touch no collaborator.
    pub async fn handle(&self, request: RescoreRequest) -> Result<RescoreOutcome, RescoreError> {
        let job = request.into_job(self.config.default_top_n)?;
        self.run(job).await
    }

    pub async fn run(&self, job: RescoreJob) -> Result<RescoreOutcome, RescoreError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("rescore_run", %run_id, job_id = %job.job_id);
        self.run_inner(run_id, job).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, job: RescoreJob) -> Result<RescoreOutcome, RescoreError> {
        let started_at = Utc::now();

        let posting = self
            .store
            .job_posting(&job.job_id)
            .await
            .map_err(RescoreError::JobLookup)?
            .ok_or_else(|| RescoreError::JobNotFound(job.job_id.clone()))?;

        let candidates = CandidateSource::new(Arc::clone(&self.store))
            .resolve(&job)
            .await
            .map_err(RescoreError::CandidateResolution)?;
        let pool = WorkerPool::new(self.config.concurrency);
        info!(
            candidates = candidates.len(),
            top_n = job.top_n,
            score_all_students = job.score_all_students,
            concurrency = pool.concurrency(),
            "resolved candidates"
        );

        let ctx = Arc::new(ScoringContext {
            store: Arc::clone(&self.store),
            oracle: Arc::clone(&self.oracle),
            sink: ResultSink::new(Arc::clone(&self.store), self.config.call_timeout),
            job_id: job.job_id.clone(),
            job_text: job_text(&posting),
            call_timeout: self.config.call_timeout,
        });
        let results = pool
            .run(candidates, move |candidate| {
                let ctx = Arc::clone(&ctx);
                async move { ctx.process(candidate).await }
            })
            .await?;

        let scored = results.iter().filter(|r| r.gpt_score.is_some()).count();
        let unscored = results.len() - scored;
        let finished_at = Utc::now();
        info!(
            scored,
            unscored,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "rescore run complete"
        );

        Ok(RescoreOutcome {
            run_id,
            job_id: job.job_id,
            started_at,
            finished_at,
            scored,
            unscored,
            results,
        })
    }
}
