pub mod audio;
pub mod chat;
pub mod error;
pub mod ingest;
pub mod json_file;
pub mod lesson;
pub mod message_log;
pub mod roster;
pub mod search;
pub mod session;
pub mod settings;
pub mod speech;
pub mod sse;
pub mod store;

pub use error::{Result, TutorError};
pub use ingest::{RuleContent, SourceDocument};
pub use lesson::LessonTrigger;
pub use session::{ExplanationSession, SendOutcome, SessionDeps, SessionEvent};
