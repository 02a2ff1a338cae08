#![forbid(unsafe_code)]

//! Keeps the search index and the blob store in step with relational
//! transactions. Changes are collected per unit of work and only leave the
//! process once the relational commit has succeeded.

pub mod clients;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod index_writer;
pub mod memory;
pub mod tracker;

pub use config::SyncConfig;
pub use content::{ContentStager, StagingSession};
pub use coordinator::{CommitCoordinator, IndexRegistration, SessionSync};
pub use dispatcher::{JobDispatcher, JobSequence};
pub use error::SyncError;
pub use hooks::{HookChain, NoHooks, UnitOfWorkHooks};
pub use index_writer::{IndexBatch, IndexOperation, IndexReport, IndexWriter, OperationRegistry};
pub use tracker::{MutationSnapshot, MutationTracker};
