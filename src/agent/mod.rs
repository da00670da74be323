//! The agent run: event protocol, orchestration and report reconciliation.

pub mod events;
pub mod report;
pub mod run;

pub use events::{AgentEvent, EventSink, Phase};
pub use report::{build_report, AgentReport, ReportInput, ReportStatus};
pub use run::AgentRun;
