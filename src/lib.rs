pub mod args;
pub mod cancel;
pub mod error;
pub mod frame;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod stages;
pub mod supervisor;
pub mod tool;
pub mod workspace;

pub use args::Args;
pub use error::Error;
pub use orchestrator::{Orchestrator, SessionReport, SessionStatus};
pub use workspace::Workspace;
