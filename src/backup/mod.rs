//! Single backup runs: dump, replicate, record.

pub mod archive;
pub mod db_dump;
pub mod logic;
pub mod replicate;

pub use db_dump::{CommandDumper, DumpArtifact, DumpProducer};
pub use logic::{BackupExecutor, DeletionReport, FileCheck, VerificationReport};
pub use replicate::{Replicator, aggregate_status};
