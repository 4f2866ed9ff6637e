//! Cases, facilities and reader profiles.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ExperienceLevel;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Case {
    pub case_id: String,
    pub basename: String,
    pub ground_truth: String,
    pub ai_prediction: String,
    pub ai_confidence: f64,
    pub ai_correct: bool,
    pub has_prediction: bool,
}

impl Case {
    /// `CASE-0001` style identifier for the 1-based row `index`.
    pub fn numbered_id(index: usize) -> String {
        format!("CASE-{index:04}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Facility {
    pub facility_id: String,
    pub name: String,
    pub slug: String,
    /// Prefix of every reader id issued here, e.g. `OSK`.
    pub prefix: String,
    pub next_reader_number: u32,
    #[serde(default)]
    pub recycled_numbers: BTreeSet<u32>,
    #[serde(default)]
    pub admins: Vec<String>,
}

impl Facility {
    pub fn new(
        facility_id: impl Into<String>,
        name: impl Into<String>,
        slug: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            facility_id: facility_id.into(),
            name: name.into(),
            slug: slug.into(),
            prefix: prefix.into(),
            next_reader_number: 1,
            recycled_numbers: BTreeSet::new(),
            admins: Vec::new(),
        }
    }

    pub fn reader_id(&self, number: u32) -> String {
        format!("{}_{:03}", self.prefix, number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReaderProfile {
    pub email: String,
    pub reader_id: String,
    pub reader_number: u32,
    pub facility_id: String,
    pub facility_name: String,
    pub reader_level: ExperienceLevel,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}
