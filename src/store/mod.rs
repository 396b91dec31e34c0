pub mod incoming;
pub mod resume;

pub use incoming::{IncomingFile, IncomingStore};
pub use resume::{ResumeStore, TransferResumeState};
