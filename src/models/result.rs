use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AiDiagnosis, AiReference, Condition, DiagnosisClass, ExperienceLevel, Session};
use crate::error::{Result, StudyError};

const SCALE_MIN: u8 = 1;
const SCALE_MAX: u8 = 5;

/// What a reader entered for one case, before timing is attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseAnswer {
    pub diagnosis: DiagnosisClass,
    #[serde(default)]
    pub diagnosis_other: Option<String>,
    #[serde(default)]
    pub ai_diagnosis: Option<AiDiagnosis>,
    pub confidence: u8,
    #[serde(default)]
    pub ai_reference: Option<AiReference>,
    #[serde(default)]
    pub gradcam_helpful: Option<u8>,
}

impl CaseAnswer {
    pub fn new(diagnosis: DiagnosisClass, confidence: u8) -> Self {
        Self {
            diagnosis,
            diagnosis_other: None,
            ai_diagnosis: None,
            confidence,
            ai_reference: None,
            gradcam_helpful: None,
        }
    }

    pub fn with_ai_reference(mut self, reference: AiReference) -> Self {
        self.ai_reference = Some(reference);
        self
    }

    pub fn with_gradcam_helpful(mut self, score: u8) -> Self {
        self.gradcam_helpful = Some(score);
        self
    }

    /// Returns every missing or out-of-range field for `condition`.
    pub fn validation_errors(&self, condition: Condition) -> Vec<String> {
        let mut errors = Vec::new();
        if !(SCALE_MIN..=SCALE_MAX).contains(&self.confidence) {
            errors.push(format!("confidence must be {SCALE_MIN}-{SCALE_MAX}"));
        }
        if condition.shows_ai() && self.ai_reference.is_none() {
            errors.push("ai_reference is required".to_string());
        }
        if condition.shows_gradcam() {
            match self.gradcam_helpful {
                None => errors.push("gradcam_helpful is required".to_string()),
                Some(score) if !(SCALE_MIN..=SCALE_MAX).contains(&score) => {
                    errors.push(format!("gradcam_helpful must be {SCALE_MIN}-{SCALE_MAX}"))
                }
                Some(_) => {}
            }
        }
        errors
    }

    pub fn validate(&self, condition: Condition) -> Result<()> {
        let errors = self.validation_errors(condition);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StudyError::InvalidAnswer(errors.join("; ")))
        }
    }
}

/// Net reading time measured for one case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadingTiming {
    pub reading_time_ms: u64,
    pub pause_count: u32,
    pub pause_total_ms: u64,
}

/// One record per (session, case); keyed by `case_id` inside its session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadingResult {
    pub session_id: String,
    pub reader_id: String,
    pub facility: String,
    pub reader_level: ExperienceLevel,
    #[serde(rename = "task_type")]
    pub condition: Condition,
    pub case_id: String,
    /// 1-based position of the case in the session's order.
    pub case_order: u32,
    pub diagnosis: DiagnosisClass,
    pub diagnosis_other: Option<String>,
    pub ai_diagnosis: Option<AiDiagnosis>,
    pub confidence: u8,
    pub ai_reference: Option<AiReference>,
    pub gradcam_helpful: Option<u8>,
    pub reading_time_ms: u64,
    pub pause_count: u32,
    pub pause_total_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ReadingResult {
    /// Validates `answer` for the session's condition and drops fields the
    /// condition does not collect.
    pub fn build(
        session: &Session,
        case_id: &str,
        answer: CaseAnswer,
        timing: ReadingTiming,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        answer.validate(session.condition)?;
        let case_order =
            session
                .case_position(case_id)?
                .ok_or_else(|| StudyError::CaseNotInSession {
                    session_id: session.session_id.clone(),
                    case_id: case_id.to_string(),
                })?;

        let condition = session.condition;
        Ok(Self {
            session_id: session.session_id.clone(),
            reader_id: session.reader_id.clone(),
            facility: session.facility.clone(),
            reader_level: session.reader_level,
            condition,
            case_id: case_id.to_string(),
            case_order,
            diagnosis: answer.diagnosis,
            diagnosis_other: answer
                .diagnosis_other
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty()),
            ai_diagnosis: answer.ai_diagnosis.filter(|_| condition.shows_ai()),
            confidence: answer.confidence,
            ai_reference: answer.ai_reference.filter(|_| condition.shows_ai()),
            gradcam_helpful: answer.gradcam_helpful.filter(|_| condition.shows_gradcam()),
            reading_time_ms: timing.reading_time_ms,
            pause_count: timing.pause_count,
            pause_total_ms: timing.pause_total_ms,
            timestamp,
        })
    }
}
