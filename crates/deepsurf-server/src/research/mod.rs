//! Deep research: task decomposition, a bounded tool loop per subtask, and synthesis.

pub mod memo;
pub mod orchestrator;
pub mod tools;

pub use memo::MemoCache;
pub use orchestrator::{ResearchOrchestrator, ResearchRequest, SubTask, SubTaskStatus};
pub use tools::{ToolBox, ToolCall, ToolOutput};
