//! Transaction snapshots minted by the commit manager.

use serde::{Deserialize, Serialize};

/// The kind of transaction a snapshot was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Full read-write transaction.
    ReadWrite,
    /// Reads only; staging any change is refused at commit.
    ReadOnly,
    /// Read-only with access to pushed-down scans.
    Analytical,
}

/// An immutable view of the store at a commit-manager-issued version.
///
/// `version` doubles as the transaction's write version and as the upper
/// bound for visible reads. `lowest_active_version` is the smallest version
/// any live transaction can still observe; index garbage collection uses it
/// to decide which tombstones are dead to every reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The transaction's read/write version.
    pub version: u64,
    /// Smallest version still observable by any live transaction.
    pub lowest_active_version: u64,
}

impl Snapshot {
    /// Creates a snapshot descriptor.
    #[must_use]
    pub const fn new(version: u64, lowest_active_version: u64) -> Self {
        Self {
            version,
            lowest_active_version,
        }
    }
}
