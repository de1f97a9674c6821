//! Protocol-level transaction identifiers.
//!
//! A global transaction id (gtrid) names one distributed transaction. Every
//! resource enlisted in it gets its own branch qualifier (bqual); the pair,
//! together with a format id, is the [`Xid`] handed to resource managers.
//!
//! Gtrid layout (big-endian):
//! ┌──────────────────┬──────────────────────┬──────────────┐
//! │ server id bytes  │ instance id (16)     │ sequence (4) │
//! └──────────────────┴──────────────────────┴──────────────┘
//! - `server id`   : the configured name of the coordinator node
//! - `instance id` : random per coordinator start, separates restarts
//! - `sequence`    : per-instance counter

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{UidError, UidResult};

/// Format id stamped on every xid this coordinator creates ("MTX\0").
pub const FORMAT_ID: i32 = 0x4d54_5800;

/// Longest gtrid accepted by the resource-manager protocol.
pub const MAX_GTRID_LEN: usize = 64;

const INSTANCE_LEN: usize = 16;
const SEQUENCE_LEN: usize = 4;
const SUFFIX_LEN: usize = INSTANCE_LEN + SEQUENCE_LEN;

/// Longest server id that still fits in a gtrid.
pub const MAX_SERVER_ID_LEN: usize = MAX_GTRID_LEN - SUFFIX_LEN;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalTransactionId(Vec<u8>);

impl GlobalTransactionId {
    pub fn new(server_id: &[u8], instance: Uuid, sequence: u32) -> UidResult<Self> {
        check_server_id(server_id)?;
        let mut bytes = Vec::with_capacity(server_id.len() + SUFFIX_LEN);
        bytes.extend_from_slice(server_id);
        bytes.extend_from_slice(instance.as_bytes());
        bytes.extend_from_slice(&sequence.to_be_bytes());
        Ok(Self(bytes))
    }

    /// Rebuilds a gtrid from raw bytes, e.g. as reported by a resource manager.
    pub fn from_bytes(bytes: Vec<u8>) -> UidResult<Self> {
        let len = bytes.len();
        if len <= SUFFIX_LEN {
            return Err(UidError::GtridTooShort {
                len,
                min: SUFFIX_LEN + 1,
            });
        }
        if len > MAX_GTRID_LEN {
            return Err(UidError::GtridTooLong {
                len,
                max: MAX_GTRID_LEN,
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn server_id(&self) -> &[u8] {
        &self.0[..self.0.len() - SUFFIX_LEN]
    }

    pub fn instance(&self) -> Uuid {
        let start = self.0.len() - SUFFIX_LEN;
        let mut raw = [0u8; INSTANCE_LEN];
        raw.copy_from_slice(&self.0[start..start + INSTANCE_LEN]);
        Uuid::from_bytes(raw)
    }

    pub fn sequence(&self) -> u32 {
        let start = self.0.len() - SEQUENCE_LEN;
        let mut raw = [0u8; SEQUENCE_LEN];
        raw.copy_from_slice(&self.0[start..]);
        u32::from_be_bytes(raw)
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gtrid(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

/// Branch qualifier, unique within one global transaction.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(Vec<u8>);

impl BranchId {
    pub fn from_counter(counter: u32) -> Self {
        Self(counter.to_be_bytes().to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bqual(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

/// The identifier pair handed to resource managers.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    gtrid: GlobalTransactionId,
    bqual: BranchId,
}

impl Xid {
    pub fn new(gtrid: GlobalTransactionId, bqual: BranchId) -> Self {
        Self::with_format(FORMAT_ID, gtrid, bqual)
    }

    /// Builds an xid with an arbitrary format id, used for branches reported by
    /// resource managers that may belong to other coordinators.
    pub fn with_format(format_id: i32, gtrid: GlobalTransactionId, bqual: BranchId) -> Self {
        Self {
            format_id,
            gtrid,
            bqual,
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid(&self) -> &GlobalTransactionId {
        &self.gtrid
    }

    pub fn bqual(&self) -> &BranchId {
        &self.bqual
    }

    /// Returns true if this xid was minted by a minitx coordinator.
    pub fn is_ours(&self) -> bool {
        self.format_id == FORMAT_ID
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}:{}", self.format_id, self.gtrid, self.bqual)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

pub(crate) fn check_server_id(server_id: &[u8]) -> UidResult<()> {
    if server_id.is_empty() {
        return Err(UidError::EmptyServerId);
    }
    if server_id.len() > MAX_SERVER_ID_LEN {
        return Err(UidError::ServerIdTooLong {
            len: server_id.len(),
            max: MAX_SERVER_ID_LEN,
        });
    }
    Ok(())
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gtrid_layout() {
        let instance = Uuid::new_v4();
        let gtrid = GlobalTransactionId::new(b"node-a", instance, 7).unwrap();
        assert_eq!(gtrid.server_id(), b"node-a");
        assert_eq!(gtrid.instance(), instance);
        assert_eq!(gtrid.sequence(), 7);
        assert_eq!(gtrid.as_bytes().len(), 6 + SUFFIX_LEN);
    }

    #[test]
    fn test_gtrid_from_bytes_bounds() {
        assert!(matches!(
            GlobalTransactionId::from_bytes(vec![1; SUFFIX_LEN]),
            Err(UidError::GtridTooShort { .. })
        ));
        assert!(matches!(
            GlobalTransactionId::from_bytes(vec![1; MAX_GTRID_LEN + 1]),
            Err(UidError::GtridTooLong { .. })
        ));

        let gtrid = GlobalTransactionId::new(b"x", Uuid::nil(), 1).unwrap();
        let copy = GlobalTransactionId::from_bytes(gtrid.as_bytes().to_vec()).unwrap();
        assert_eq!(gtrid, copy);
    }

    #[test]
    fn test_server_id_limits() {
        assert_eq!(
            GlobalTransactionId::new(b"", Uuid::nil(), 1),
            Err(UidError::EmptyServerId)
        );
        let long = vec![b'a'; MAX_SERVER_ID_LEN + 1];
        assert!(matches!(
            GlobalTransactionId::new(&long, Uuid::nil(), 1),
            Err(UidError::ServerIdTooLong { .. })
        ));
        let longest = vec![b'a'; MAX_SERVER_ID_LEN];
        let gtrid = GlobalTransactionId::new(&longest, Uuid::nil(), 1).unwrap();
        assert_eq!(gtrid.as_bytes().len(), MAX_GTRID_LEN);
    }

    #[test]
    fn test_xid_display() {
        let gtrid = GlobalTransactionId::from_bytes(vec![0xab; SUFFIX_LEN + 1]).unwrap();
        let xid = Xid::new(gtrid, BranchId::from_counter(2));
        let shown = xid.to_string();
        assert!(shown.starts_with("4d545800:abab"));
        assert!(shown.ends_with(":00000002"));
        assert!(xid.is_ours());

        let foreign = Xid::with_format(1, xid.gtrid().clone(), xid.bqual().clone());
        assert!(!foreign.is_ours());
    }
}
