//! Checker: the grading pipeline behind `labcheck run`.
//!
//! ## Overview
//!
//! Students' answer files arrive as Inbound queue records. A pool of workers
//! claims them one at a time, screens the files, runs the survivors inside a
//! disposable container and folds the per-task report into the student's
//! homework record. Results and rejections leave through the Outbound and
//! Rejected queues, which the notifier side drains.
//!
//! ## Module Map
//!
//! ```text
//!  Inbound ──> pipeline.rs  (Orchestrator, worker pool)
//!                 │
//!                 │ SubmissionStager::stage()
//!                 v
//!              stager.rs    (staging dir, TemplateMismatch) ──┐
//!                 │                                           │
//!                 │ PolicyEngine::run()                       │
//!                 v                                           │
//!              policy.rs    (keywords, imports, PolicyViolation) ──> Rejected
//!                 │                                           │
//!                 │ Sandbox::run()                            │
//!                 v                                           │
//!              sandbox.rs   (image build, one container) ─────┘ SandboxFailure
//!                 │  └─ runtime.rs (ContainerRuntime trait, DockerRuntime)
//!                 │  └─ logger.rs  (ReportLogger, harness events)
//!                 │
//!                 │ score_submission()
//!                 v
//!              scorer.rs    (homework record update) ──> Outbound
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Queue payloads, disciplines, homework and report types  |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `embedded` | pytest harness copied into every image (`rust-embed`)   |
//! | `notify`   | Text rendering of Outbound and Rejected payloads        |

pub mod db;
pub mod embedded;
pub mod logger;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod policy;
pub mod runtime;
pub mod sandbox;
pub mod scorer;
pub mod stager;
