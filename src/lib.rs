//! Ferry — background file transfer engine.
//!
//! A long-running service that executes HTTP(S) download and upload tasks on
//! behalf of a client, surviving transient network loss and process
//! restarts. Tasks are submitted through the [`Engine`] facade, gated by a
//! priority holding queue with concurrency caps, executed by per-task
//! workers with ranged resume, and reported back over a status/progress
//! update bus. Task state persists in a file-backed store so work resumes
//! across restarts.
//!
//! ```no_run
//! use ferry::{Engine, EngineConfig, Task};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineConfig::default())?;
//! let mut updates = engine.subscribe();
//! engine.start().await?;
//!
//! let mut task = Task::download("report-1", "https://example.com/report.pdf");
//! task.filename = "report.pdf".to_string();
//! engine.enqueue(task, None);
//!
//! while let Ok(update) = updates.recv().await {
//!     println!("{:?}", update.task().task_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod paths;
pub mod queue;
pub mod retry;
pub mod store;
pub mod task;
pub mod transport;
pub mod worker;

pub use config::{BaseDirs, EngineConfig, ProxyConfig};
pub use engine::tracker::TaskRecord;
pub use engine::Engine;
pub use error::{ExceptionKind, TaskError, TaskException};
pub use events::{TaskProgressUpdate, TaskStatusUpdate, TaskUpdate};
pub use task::{BaseDirectory, ResumeData, Task, TaskKind, TaskStatus, Updates};
