//! Shared identifiers and status types for the minitx transaction coordinator.
//!
//! This crate holds everything that both the journal and the coordinator need to
//! agree on: how a global transaction is named, how a branch is named, and the
//! status vocabulary written to the journal.

pub mod error;
pub mod status;
pub mod uid;
pub mod xid;

pub use error::{UidError, UidResult};
pub use status::{HeuristicOutcome, RecordStatus, Status};
pub use uid::{BranchIdGenerator, UidGenerator};
pub use xid::{
    BranchId, FORMAT_ID, GlobalTransactionId, MAX_GTRID_LEN, MAX_SERVER_ID_LEN, Xid,
};
