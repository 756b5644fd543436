pub mod credentials;
pub mod enrollment;
pub mod ledger;
pub mod model_store;
pub mod spreadsheet;

pub use credentials::CredentialStore;
pub use enrollment::EnrollmentWriter;
pub use ledger::{AttendanceLedger, IdentityRecord, LedgerStore, RecordOutcome, Thresholds};
pub use model_store::{FeatureSet, ModelStore};
pub use spreadsheet::XlsxLedgerStore;
