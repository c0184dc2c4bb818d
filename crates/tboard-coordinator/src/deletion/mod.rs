//! Asynchronous run deletion: `TO_DELETE -> DELETING -> DELETED`, with a
//! failure ledger for runs whose deletion gave up.

pub mod artifacts;
pub mod ledger;
pub mod notify;
mod worker;

pub use artifacts::{ArtifactStore, FsArtifactStore, NoArtifacts};
pub use ledger::{DeletionLedger, LedgerSnapshot};
pub use notify::{group_for_owner, LedgerUpdate, NotificationHub};
pub use worker::{DeletionPipeline, DeletionWorker, EnqueueOutcome};
