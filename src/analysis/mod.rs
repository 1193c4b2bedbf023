pub mod alerts;
pub mod reporter;

pub use alerts::{Alert, AlertFeed, SuspiciousActivityRecord};
pub use reporter::FrameReporter;
