pub mod ledger;
pub mod profile_store;
pub mod snapshots;

pub use ledger::{
    AlertSink, ChainReport, DetectionEvent, DetectionLedger, DetectionPage, DetectionQuery,
    DetectionStats, JsonlLedger, LedgerBackend, LedgerError, LedgerRecord, MemoryLedger,
    OperationalAlert, Sealer, TracingAlertSink,
};
pub use profile_store::{
    CreateOptions, FileProfileStore, MemoryProfileStore, Profile, ProfileCounts, ProfileStore,
    StoredEmbedding,
};
pub use snapshots::SnapshotWriter;
