//! Auto Run batch scheduler: parses playbook markdown
//! documents, iterates documents × tasks × loops, dispatches each task via
//! the process supervisor, updates task checkboxes atomically, and
//! collects usage into history/badges.

pub mod playbook;
pub mod scheduler;
pub mod template;
pub mod worktree;

pub use playbook::{Playbook, PlaybookStore, Task, WorktreeSettings};
pub use scheduler::{BatchRunState, DocumentProgress, RunOptions, Scheduler};
