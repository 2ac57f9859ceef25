//! Identifier and value types shared by every xrepl subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::MasterError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates the identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true if the identifier is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a table in the table catalog.
    TableId
);
string_id!(
    /// Identifier of a namespace (database).
    NamespaceId
);
string_id!(
    /// Identifier of a tablet.
    TabletId
);
string_id!(
    /// User-chosen identifier of an xCluster replication group.
    ReplicationGroupId
);
string_id!(
    /// Identifier of a snapshot on either side of a bootstrap.
    SnapshotId
);
string_id!(
    /// Identifier of a snapshot restoration.
    RestorationId
);

/// Random 128-bit identifier of a CDC stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId([u8; 16]);

impl StreamId {
    /// Generates a fresh random stream id. Callers must check it against the
    /// in-use set before handing it out.
    pub fn generate() -> Self {
        StreamId(uuid::Uuid::new_v4().into_bytes())
    }

    /// Creates a stream id from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        StreamId(bytes)
    }

    /// Returns the raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).simple())
    }
}

impl FromStr for StreamId {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::try_parse(s)
            .map(|u| StreamId(u.into_bytes()))
            .map_err(|_| MasterError::InvalidArgument(format!("invalid stream id: {s}")))
    }
}

/// Term of the master leader that issues a sys catalog write.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaderTerm(u64);

impl LeaderTerm {
    /// Creates a term from a raw value.
    pub fn new(term: u64) -> Self {
        LeaderTerm(term)
    }

    /// Returns the raw term value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaderTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in a tablet's write-ahead log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    /// Raft term of the operation.
    pub term: i64,
    /// Raft index of the operation.
    pub index: i64,
}

impl OpId {
    /// Not yet streamed or bootstrapped.
    pub const INVALID: OpId = OpId { term: -1, index: -1 };
    /// Start of the log; used for freshly split children.
    pub const MIN: OpId = OpId { term: 0, index: 0 };
    /// Retired; the row is safe to ignore and garbage-collect.
    pub const MAX: OpId = OpId {
        term: i64::MAX,
        index: i64::MAX,
    };

    /// Creates an op id.
    pub fn new(term: i64, index: i64) -> Self {
        OpId { term, index }
    }

    /// Returns true unless this is [`OpId::INVALID`].
    pub fn is_valid(&self) -> bool {
        self.term >= 0 && self.index >= 0
    }

    /// Returns true if this is [`OpId::MAX`].
    pub fn is_max(&self) -> bool {
        *self == OpId::MAX
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Hybrid logical time: physical microseconds shifted left by 12 bits plus a
/// logical component.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl HybridTime {
    const LOGICAL_BITS: u32 = 12;

    /// Creates a hybrid time from its raw encoding.
    pub fn from_raw(raw: u64) -> Self {
        HybridTime(raw)
    }

    /// Creates a hybrid time with the given physical microseconds and zero
    /// logical component.
    pub fn from_micros(micros: u64) -> Self {
        HybridTime(micros << Self::LOGICAL_BITS)
    }

    /// Reads the local wall clock.
    pub fn now() -> Self {
        Self::from_micros(now_micros())
    }

    /// Returns the raw encoding.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the physical component in microseconds.
    pub fn physical_micros(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ physical: {} }}", self.physical_micros())
    }
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Point in time after which a blocking operation gives up with `TimedOut`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(tokio::time::Instant);

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(tokio::time::Instant::now() + timeout)
    }

    /// The underlying instant.
    pub fn instant(&self) -> tokio::time::Instant {
        self.0
    }

    /// Returns true once the deadline has passed.
    pub fn expired(&self) -> bool {
        tokio::time::Instant::now() >= self.0
    }

    /// Time left before the deadline, zero if already expired.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(tokio::time::Instant::now())
    }
}

/// Defines a closed set of option values with a canonical upper-case
/// string form, as stored in a stream's option bag.
macro_rules! option_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Canonical string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MasterError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($s => Ok($name::$variant),)+
                    _ => Err(MasterError::InvalidArgument(format!(
                        "invalid {} value: {}",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }
    };
}

option_enum!(
    /// Which images a change record carries.
    CdcRecordType {
        /// Changed columns only.
        Change => "CHANGE",
        /// Full before and after images.
        All => "ALL",
        /// Full row after image.
        FullRowNewImage => "FULL_ROW_NEW_IMAGE",
        /// Modified columns, before and after.
        ModifiedColumnsOldAndNewImages => "MODIFIED_COLUMNS_OLD_AND_NEW_IMAGES",
        /// Postgres REPLICA IDENTITY FULL.
        PgFull => "PG_FULL",
        /// Postgres CHANGE with old and new images.
        PgChangeOldNew => "PG_CHANGE_OLD_NEW",
        /// Postgres REPLICA IDENTITY DEFAULT.
        PgDefault => "PG_DEFAULT",
        /// Postgres REPLICA IDENTITY NOTHING.
        PgNothing => "PG_NOTHING",
    }
);

option_enum!(
    /// Encoding of change records.
    CdcRecordFormat {
        /// JSON records.
        Json => "JSON",
        /// Raw WAL records, used by xCluster.
        Wal => "WAL",
        /// Protobuf change events, used by CDCSDK.
        Proto => "PROTO",
    }
);

option_enum!(
    /// Consumer family of a stream.
    CdcSourceType {
        /// Cross-cluster replication.
        Xcluster => "XCLUSTER",
        /// Change data capture SDK / logical replication.
        Cdcsdk => "CDCSDK",
    }
);

option_enum!(
    /// How checkpoints advance.
    CdcCheckpointType {
        /// Advanced by the server on every poll.
        Implicit => "IMPLICIT",
        /// Advanced explicitly by the client.
        Explicit => "EXPLICIT",
    }
);

option_enum!(
    /// What the stream's target id refers to.
    IdType {
        /// A single table.
        TableId => "TABLEID",
        /// A whole namespace.
        NamespaceId => "NAMESPACEID",
    }
);

option_enum!(
    /// Postgres replica identity of a table inside a slot-backed stream.
    PgReplicaIdentity {
        /// Primary key columns.
        Default => "DEFAULT",
        /// Whole row.
        Full => "FULL",
        /// No old image.
        Nothing => "NOTHING",
        /// Changed columns.
        Change => "CHANGE",
    }
);

option_enum!(
    /// Snapshot behaviour requested when a replication slot is created.
    CdcsdkSnapshotOption {
        /// The slot's snapshot is used by the creating transaction.
        UseSnapshot => "USE_SNAPSHOT",
        /// No snapshot is exported.
        NoExportSnapshot => "NOEXPORT_SNAPSHOT",
        /// The snapshot is exported to other sessions.
        ExportSnapshot => "EXPORT_SNAPSHOT",
    }
);

option_enum!(
    /// Error kinds reported for a replicating stream.
    ReplicationErrorCode {
        /// The producer GC'd log records the consumer still needs.
        MissingOp => "MISSING_OP",
        /// Producer and consumer schemas diverged.
        SchemaMismatch => "SCHEMA_MISMATCH",
        /// The consumer table is gone.
        MissingTable => "MISSING_TABLE",
    }
);

impl PartialOrd for ReplicationErrorCode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReplicationErrorCode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// Progress markers of a namespace stream creation, used to pick the
/// compensating action when a later step fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CreationState {
    /// Nothing has been published yet.
    Initialized,
    /// The stream is visible in the in-memory maps.
    AddedToMaps,
    /// The sys catalog write has been issued.
    PreCommitMutation,
    /// The sys catalog write succeeded and the in-memory copy is committed.
    PostCommitMutation,
    /// Every side effect is in place.
    Ready,
}
