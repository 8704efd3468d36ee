//! Core domain model and scoring-text builders for OJT match rescoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ojt-core";

/// Job posting as read from storage. Absent columns deserialize to empty values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobPosting {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ai_skills: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub must_have_qualifications: Vec<String>,
    #[serde(default)]
    pub nice_to_have_qualifications: Vec<String>,
}

/// A student queued for scoring against one job, with the upstream ranking signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentCandidate {
    pub student_id: String,
    #[serde(default)]
    pub similarity: f64,
}

impl StudentCandidate {
    pub fn new(student_id: impl Into<String>, similarity: f64) -> Self {
        Self {
            student_id: student_id.into(),
            similarity,
        }
    }

    /// Candidate with no ranking signal, used when every student is scored.
    pub fn unranked(student_id: impl Into<String>) -> Self {
        Self::new(student_id, 0.0)
    }
}

/// Skills are stored either as a tag list or as a free-text blurb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Skills {
    List(Vec<String>),
    Text(String),
}

impl Default for Skills {
    fn default() -> Self {
        Skills::List(Vec::new())
    }
}

impl Skills {
    pub fn render(&self) -> String {
        match self {
            Skills::List(items) => items.join(", "),
            Skills::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Certificate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub issue_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Experience {
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortfolioEntry {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Student profile fields that feed the scoring prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StudentProfile {
    pub id: String,
    #[serde(default)]
    pub introduction: Option<String>,
    #[serde(default)]
    pub career_goals: Option<String>,
    #[serde(default)]
    pub skills: Skills,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
    #[serde(default)]
    pub experiences: Vec<Experience>,
    #[serde(default)]
    pub portfolio: Vec<PortfolioEntry>,
}

/// Persisted scoring row. One row exists per (student_id, job_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub student_id: String,
    pub job_id: String,
    pub raw_similarity: f64,
    pub match_score: f64,
    pub gpt_score: Option<u8>,
    pub scored_at: DateTime<Utc>,
}

impl ScoreResult {
    pub fn new(
        candidate: &StudentCandidate,
        job_id: &str,
        gpt_score: Option<u8>,
        scored_at: DateTime<Utc>,
    ) -> Self {
        Self {
            student_id: candidate.student_id.clone(),
            job_id: job_id.to_string(),
            raw_similarity: candidate.similarity,
            match_score: candidate.similarity * 100.0,
            gpt_score,
            scored_at,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.student_id.clone(), self.job_id.clone())
    }
}

/// Per-candidate entry in a rescoring response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub student_id: String,
    pub raw_similarity: f64,
    pub gpt_score: Option<u8>,
}

impl From<&ScoreResult> for ScoreRecord {
    fn from(result: &ScoreResult) -> Self {
        Self {
            student_id: result.student_id.clone(),
            raw_similarity: result.raw_similarity,
            gpt_score: result.gpt_score,
        }
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

fn bullet_lines<T>(items: &[T], render: impl Fn(&T) -> String) -> String {
    items
        .iter()
        .map(|item| format!("- {}", render(item)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Flatten a job posting into the single-line text block sent to the oracle.
pub fn job_text(job: &JobPosting) -> String {
    let raw = format!(
        "Job title: {}\nDescription: {}\nSkills: {}\nTags: {}\nMust-have qualifications: {}\nNice-to-have qualifications: {}",
        text(&job.title),
        text(&job.description),
        job.ai_skills.join(", "),
        job.tags.join(", "),
        job.must_have_qualifications.join(", "),
        job.nice_to_have_qualifications.join(", "),
    );
    collapse_whitespace(&raw)
}

/// Flatten a student profile plus optional résumé text into one line of text.
pub fn student_text(profile: &StudentProfile, resume_text: Option<&str>) -> String {
    let certificates = bullet_lines(&profile.certificates, |c| {
        format!("{} by {} ({})", text(&c.title), text(&c.issuer), text(&c.issue_date))
    });
    let experiences = bullet_lines(&profile.experiences, |e| {
        format!("{} at {} ({})", text(&e.job_title), text(&e.company), text(&e.duration))
    });
    let portfolio = bullet_lines(&profile.portfolio, |p| {
        format!("{}: {}", text(&p.title), text(&p.description))
    });

    let raw = format!(
        "Introduction: {}\nCareer goals: {}\nSkills: {}\nExpertise: {}\nCertificates:\n{}\nExperience:\n{}\nPortfolio:\n{}\nResume: {}",
        text(&profile.introduction),
        text(&profile.career_goals),
        profile.skills.render(),
        profile.expertise.join(", "),
        certificates,
        experiences,
        portfolio,
        resume_text.unwrap_or_default(),
    );
    collapse_whitespace(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn full_profile() -> StudentProfile {
        StudentProfile {
            id: "S1".into(),
            introduction: Some("Third-year  IT student.\n\nLoves  backend work.".into()),
            career_goals: Some("Backend engineer".into()),
            skills: Skills::List(vec!["Rust".into(), "SQL".into()]),
            expertise: vec!["APIs".into(), "Databases".into()],
            certificates: vec![Certificate {
                title: Some("AWS Cloud Practitioner".into()),
                issuer: Some("AWS".into()),
                issue_date: Some("2025-03-01".into()),
            }],
            experiences: vec![
                Experience {
                    job_title: Some("Intern".into()),
                    company: Some("Acme".into()),
                    duration: Some("3 months".into()),
                },
                Experience {
                    job_title: Some("Tutor".into()),
                    company: Some("Campus Lab".into()),
                    duration: Some("1 year".into()),
                },
            ],
            portfolio: vec![PortfolioEntry {
                title: Some("Inventory API".into()),
                description: Some("Axum + Postgres".into()),
            }],
        }
    }

    #[test]
    fn job_text_collapses_whitespace_and_joins_lists() {
        let job = JobPosting {
            id: "J1".into(),
            title: Some("Backend   Intern".into()),
            description: Some("Build\n\tservices".into()),
            ai_skills: vec!["Rust".into(), "Postgres".into()],
            tags: vec!["remote".into()],
            must_have_qualifications: vec!["Enrolled student".into()],
            nice_to_have_qualifications: vec![],
        };
        assert_eq!(
            job_text(&job),
            "Job title: Backend Intern Description: Build services Skills: Rust, Postgres Tags: remote Must-have qualifications: Enrolled student Nice-to-have qualifications:"
        );
    }

    #[test]
    fn missing_job_fields_render_empty() {
        let text = job_text(&JobPosting {
            id: "J2".into(),
            ..Default::default()
        });
        assert!(!text.contains("None"));
        assert!(!text.contains("null"));
        assert!(text.starts_with("Job title: Description: Skills:"));
    }

    #[test]
    fn student_text_renders_record_lists_as_bullets() {
        let text = student_text(&full_profile(), Some("Resume\n body"));
        assert!(text.contains("Introduction: Third-year IT student. Loves backend work."));
        assert!(text.contains("Skills: Rust, SQL"));
        assert!(text.contains("Certificates: - AWS Cloud Practitioner by AWS (2025-03-01)"));
        assert!(text.contains("Experience: - Intern at Acme (3 months) - Tutor at Campus Lab (1 year)"));
        assert!(text.contains("Portfolio: - Inventory API: Axum + Postgres"));
        assert!(text.ends_with("Resume: Resume body"));
        assert!(!text.contains('\n'));
        assert!(!text.contains("  "));
    }

    #[test]
    fn free_text_skills_render_verbatim() {
        let profile = StudentProfile {
            id: "S2".into(),
            skills: Skills::Text("python, data viz".into()),
            ..Default::default()
        };
        assert!(student_text(&profile, None).contains("Skills: python, data viz"));
    }

    #[test]
    fn empty_profile_never_renders_placeholders() {
        let text = student_text(
            &StudentProfile {
                id: "S3".into(),
                ..Default::default()
            },
            None,
        );
        assert_eq!(
            text,
            "Introduction: Career goals: Skills: Expertise: Certificates: Experience: Portfolio: Resume:"
        );
    }

    #[test]
    fn skills_deserialize_from_list_or_text() {
        let list: Skills = serde_json::from_str(r#"["Go","Rust"]"#).unwrap();
        assert_eq!(list, Skills::List(vec!["Go".into(), "Rust".into()]));
        let free: Skills = serde_json::from_str(r#""go and rust""#).unwrap();
        assert_eq!(free, Skills::Text("go and rust".into()));
    }

    #[test]
    fn profile_deserializes_with_missing_fields() {
        let profile: StudentProfile = serde_json::from_str(r#"{"id":"S9"}"#).unwrap();
        assert_eq!(profile.skills, Skills::default());
        assert!(profile.certificates.is_empty());
    }

    #[test]
    fn score_result_scales_similarity_into_match_score() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let result = ScoreResult::new(&StudentCandidate::new("S1", 0.9), "J1", Some(80), at);
        assert!((result.match_score - 90.0).abs() < 1e-9);
        assert_eq!(result.key(), ("S1".to_string(), "J1".to_string()));

        let record = ScoreRecord::from(&result);
        assert_eq!(record.gpt_score, Some(80));
        assert!((record.raw_similarity - 0.9).abs() < 1e-12);
    }

    #[test]
    fn unranked_candidates_have_zero_similarity() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let result = ScoreResult::new(&StudentCandidate::unranked("S4"), "J1", Some(55), at);
        assert_eq!(result.match_score, 0.0);
    }
}
