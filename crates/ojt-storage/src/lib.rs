//! Datastore contract + Postgres and in-memory implementations for OJT rescoring.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ojt_core::{JobPosting, ScoreResult, Skills, StudentCandidate, StudentProfile};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "ojt-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Reads and writes the rescoring pipeline performs against the datastore.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn job_posting(&self, job_id: &str) -> Result<Option<JobPosting>, StoreError>;

    async fn student_profile(&self, student_id: &str) -> Result<Option<StudentProfile>, StoreError>;

    async fn resume_text(&self, student_id: &str) -> Result<Option<String>, StoreError>;

    /// Precomputed similarity ranking for a job, most relevant first.
    async fn ranked_students(&self, job_id: &str) -> Result<Vec<StudentCandidate>, StoreError>;

    async fn student_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Insert or overwrite the row keyed by (student_id, job_id).
    async fn upsert_score(&self, result: &ScoreResult) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Decode a jsonb column leniently; malformed shapes degrade to the empty default.
fn json_or_default<T: DeserializeOwned + Default>(column: &str, value: Option<JsonValue>) -> T {
    match value {
        None | Some(JsonValue::Null) => T::default(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|err| {
            warn!(column, error = %err, "unexpected json shape; using empty value");
            T::default()
        }),
    }
}

fn student_from_row(row: &PgRow) -> Result<StudentProfile, sqlx::Error> {
    Ok(StudentProfile {
        id: row.try_get("id")?,
        introduction: row.try_get("introduction")?,
        career_goals: row.try_get("career_goals")?,
        skills: json_or_default::<Skills>("skills", row.try_get("skills")?),
        expertise: row.try_get("expertise")?,
        certificates: json_or_default("certificates", row.try_get("certificates")?),
        experiences: json_or_default("experiences", row.try_get("experiences")?),
        portfolio: json_or_default("portfolio", row.try_get("portfolio")?),
    })
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn job_posting(&self, job_id: &str) -> Result<Option<JobPosting>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id,
                   title,
                   description,
                   COALESCE(ai_skills, '{}') AS ai_skills,
                   COALESCE(tags, '{}') AS tags,
                   COALESCE(must_have_qualifications, '{}') AS must_have_qualifications,
                   COALESCE(nice_to_have_qualifications, '{}') AS nice_to_have_qualifications
              FROM job_postings
             WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(JobPosting {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            ai_skills: row.try_get("ai_skills")?,
            tags: row.try_get("tags")?,
            must_have_qualifications: row.try_get("must_have_qualifications")?,
            nice_to_have_qualifications: row.try_get("nice_to_have_qualifications")?,
        }))
    }

    async fn student_profile(&self, student_id: &str) -> Result<Option<StudentProfile>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id,
                   introduction,
                   career_goals,
                   skills,
                   COALESCE(expertise, '{}') AS expertise,
                   certificates,
                   experiences,
                   portfolio
              FROM students
             WHERE id = $1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(student_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn resume_text(&self, student_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT parsed_text
              FROM resumes
             WHERE student_id = $1
             ORDER BY updated_at DESC
             LIMIT 1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>("parsed_text")?),
            None => Ok(None),
        }
    }

    async fn ranked_students(&self, job_id: &str) -> Result<Vec<StudentCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT m.student_id,
                   COALESCE(m.similarity, 0) AS similarity
              FROM match_students_for_job($1) WITH ORDINALITY AS m(student_id, similarity, ord)
             ORDER BY m.ord
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StudentCandidate {
                student_id: row.try_get("student_id")?,
                similarity: row.try_get("similarity")?,
            });
        }
        Ok(out)
    }

    async fn student_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM students ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut out: Vec<String> = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("id")?);
        }
        Ok(out)
    }

    async fn upsert_score(&self, result: &ScoreResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ai_match_scores
                (student_id, job_id, match_score, raw_similarity, gpt_score, scored_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student_id, job_id) DO UPDATE
               SET match_score = EXCLUDED.match_score,
                   raw_similarity = EXCLUDED.raw_similarity,
                   gpt_score = EXCLUDED.gpt_score,
                   scored_at = EXCLUDED.scored_at
            "#,
        )
        .bind(&result.student_id)
        .bind(&result.job_id)
        .bind(result.match_score)
        .bind(result.raw_similarity)
        .bind(result.gpt_score.map(i16::from))
        .bind(result.scored_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<String, JobPosting>,
    students: BTreeMap<String, StudentProfile>,
    resumes: HashMap<String, String>,
    rankings: HashMap<String, Vec<StudentCandidate>>,
    scores: HashMap<(String, String), ScoreResult>,
}

/// In-process store for local dry runs and tests. Counts every trait call it serves.
#[derive(Debug, Default)]
pub struct MemoryMatchStore {
    state: Mutex<MemoryState>,
    calls: AtomicUsize,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, job: JobPosting) -> Self {
        self.state.get_mut().jobs.insert(job.id.clone(), job);
        self
    }

    pub fn with_student(mut self, profile: StudentProfile) -> Self {
        self.state.get_mut().students.insert(profile.id.clone(), profile);
        self
    }

    pub fn with_resume(mut self, student_id: impl Into<String>, text: impl Into<String>) -> Self {
        self.state
            .get_mut()
            .resumes
            .insert(student_id.into(), text.into());
        self
    }

    pub fn with_ranking(mut self, job_id: impl Into<String>, ranking: Vec<StudentCandidate>) -> Self {
        self.state.get_mut().rankings.insert(job_id.into(), ranking);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of persisted rows, sorted by key.
    pub async fn scores(&self) -> Vec<ScoreResult> {
        let state = self.state.lock().await;
        let mut rows = state.scores.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn job_posting(&self, job_id: &str) -> Result<Option<JobPosting>, StoreError> {
        self.record_call();
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn student_profile(&self, student_id: &str) -> Result<Option<StudentProfile>, StoreError> {
        self.record_call();
        Ok(self.state.lock().await.students.get(student_id).cloned())
    }

    async fn resume_text(&self, student_id: &str) -> Result<Option<String>, StoreError> {
        self.record_call();
        Ok(self.state.lock().await.resumes.get(student_id).cloned())
    }

    async fn ranked_students(&self, job_id: &str) -> Result<Vec<StudentCandidate>, StoreError> {
        self.record_call();
        Ok(self
            .state
            .lock()
            .await
            .rankings
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn student_ids(&self) -> Result<Vec<String>, StoreError> {
        self.record_call();
        Ok(self.state.lock().await.students.keys().cloned().collect())
    }

    async fn upsert_score(&self, result: &ScoreResult) -> Result<(), StoreError> {
        self.record_call();
        self.state
            .lock()
            .await
            .scores
            .insert(result.key(), result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ojt_core::Certificate;

    fn student(id: &str) -> StudentProfile {
        StudentProfile {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_rows_with_the_same_key() {
        let store = MemoryMatchStore::new();
        let first_at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let second_at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap();
        let candidate = StudentCandidate::new("S1", 0.8);

        store
            .upsert_score(&ScoreResult::new(&candidate, "J1", Some(60), first_at))
            .await
            .unwrap();
        store
            .upsert_score(&ScoreResult::new(&candidate, "J1", Some(75), second_at))
            .await
            .unwrap();
        store
            .upsert_score(&ScoreResult::new(&candidate, "J2", None, second_at))
            .await
            .unwrap();

        let rows = store.scores().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_id, "J1");
        assert_eq!(rows[0].gpt_score, Some(75));
        assert_eq!(rows[0].scored_at, second_at);
        assert_eq!(rows[1].gpt_score, None);
    }

    #[tokio::test]
    async fn ranking_is_returned_in_stored_order() {
        let store = MemoryMatchStore::new().with_ranking(
            "J1",
            vec![
                StudentCandidate::new("S2", 0.4),
                StudentCandidate::new("S1", 0.9),
            ],
        );
        let ranked = store.ranked_students("J1").await.unwrap();
        assert_eq!(ranked[0].student_id, "S2");
        assert_eq!(ranked[1].student_id, "S1");
        assert!(store.ranked_students("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookups_are_counted() {
        let store = MemoryMatchStore::new()
            .with_student(student("S1"))
            .with_student(student("S2"))
            .with_resume("S1", "parsed resume");
        assert_eq!(store.call_count(), 0);

        assert_eq!(store.student_ids().await.unwrap(), vec!["S1", "S2"]);
        assert_eq!(
            store.resume_text("S1").await.unwrap().as_deref(),
            Some("parsed resume")
        );
        assert!(store.resume_text("S2").await.unwrap().is_none());
        assert!(store.student_profile("S3").await.unwrap().is_none());
        assert_eq!(store.call_count(), 4);
    }

    #[test]
    fn json_columns_decode_leniently() {
        let certs: Vec<Certificate> = json_or_default(
            "certificates",
            Some(serde_json::json!([{"title": "CCNA", "issuer": "Cisco"}])),
        );
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].issue_date, None);

        let malformed: Vec<Certificate> =
            json_or_default("certificates", Some(serde_json::json!({"not": "a list"})));
        assert!(malformed.is_empty());

        let skills: Skills = json_or_default("skills", Some(JsonValue::Null));
        assert_eq!(skills, Skills::default());

        let text: Skills = json_or_default("skills", Some(serde_json::json!("welding")));
        assert_eq!(text, Skills::Text("welding".into()));
    }
}
