pub mod condition;
pub mod registry;
pub mod result;
pub mod session;

pub use condition::{AiDiagnosis, AiReference, Condition, DiagnosisClass, ExperienceLevel, UnclearMarker};
pub use registry::{Case, Facility, ReaderProfile};
pub use result::{CaseAnswer, ReadingResult, ReadingTiming};
pub use session::{Session, SessionStatus};
