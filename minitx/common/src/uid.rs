//! Global transaction id generation.

use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

use crate::error::{UidError, UidResult};
use crate::xid::{BranchId, GlobalTransactionId, check_server_id};

/// Mints gtrids for one coordinator instance.
///
/// Every generator draws a fresh random instance id, so two coordinators that
/// share a server id (or one coordinator restarted on the same journal) never
/// produce the same gtrid even though both sequences start at 1.
pub struct UidGenerator {
    server_id: Vec<u8>,
    instance: Uuid,
    counter: AtomicU32,
}

impl UidGenerator {
    /// Create a new generator for the given server id
    pub fn new(server_id: &str) -> UidResult<Self> {
        check_server_id(server_id.as_bytes())?;
        Ok(Self {
            server_id: server_id.as_bytes().to_vec(),
            instance: Uuid::new_v4(),
            counter: AtomicU32::new(1),
        })
    }

    pub fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Generate the next gtrid
    pub fn next_gtrid(&self) -> UidResult<GlobalTransactionId> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u32::MAX {
                return Err(UidError::SequenceOverflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return GlobalTransactionId::new(&self.server_id, self.instance, cur),
                Err(actual) => cur = actual,
            }
        }
    }

    /// The sequence the next gtrid will get, without consuming it.
    pub fn current_sequence(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Returns true if `gtrid` was minted by this generator.
    pub fn is_own(&self, gtrid: &GlobalTransactionId) -> bool {
        gtrid.server_id() == self.server_id.as_slice() && gtrid.instance() == self.instance
    }

    /// Returns true if `gtrid` carries this generator's server id, whichever
    /// instance minted it.
    pub fn is_same_server(&self, gtrid: &GlobalTransactionId) -> bool {
        gtrid.server_id() == self.server_id.as_slice()
    }
}

/// Hands out branch qualifiers within one transaction.
#[derive(Debug, Default)]
pub struct BranchIdGenerator {
    counter: AtomicU32,
}

impl BranchIdGenerator {
    pub fn next(&self) -> BranchId {
        BranchId::from_counter(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
