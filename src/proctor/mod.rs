pub mod deadline;
pub mod session;
pub mod warning;
pub mod window;

pub use deadline::{DeadlineEvent, ExamDeadline};
pub use session::{
    ComplianceSignal, ExitOutcome, ProctorSession, SessionNotice, SessionOptions, SessionState,
};
pub use warning::{
    FileWarningStore, MemoryWarningStore, WarningCounter, WarningReader, WarningStore,
};
pub use window::{ExamWindow, HeadlessWindow, WindowCall};
