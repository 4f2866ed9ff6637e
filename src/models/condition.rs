//! Fixed enumerations shared by sessions and reading results.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One experimental arm of the study.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Unaided,
    AiOnly,
    AiGradcam,
}

impl Condition {
    pub const ALL: [Condition; 3] = [Condition::Unaided, Condition::AiOnly, Condition::AiGradcam];

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Unaided => "unaided",
            Condition::AiOnly => "ai_only",
            Condition::AiGradcam => "ai_gradcam",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    /// AI classification is displayed alongside the image.
    pub fn shows_ai(&self) -> bool {
        matches!(self, Condition::AiOnly | Condition::AiGradcam)
    }

    pub fn shows_gradcam(&self) -> bool {
        matches!(self, Condition::AiGradcam)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceLevel {
    Specialist,
    General,
    Resident,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiagnosisClass {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "infection")]
    Infection,
    #[serde(rename = "non-infection")]
    NonInfection,
    #[serde(rename = "scar")]
    Scar,
    #[serde(rename = "tumor")]
    Tumor,
    #[serde(rename = "deposit")]
    Deposit,
    #[serde(rename = "APAC")]
    Apac,
    #[serde(rename = "lens opacity")]
    LensOpacity,
    #[serde(rename = "bullous")]
    Bullous,
}

/// What the reader believes the AI predicted; `Unclear` is allowed here only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AiDiagnosis {
    Class(DiagnosisClass),
    Unclear(UnclearMarker),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnclearMarker {
    Unclear,
}

/// How the AI output influenced the final diagnosis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiReference {
    Followed,
    Changed,
    Independent,
}
