//! Opcodes carried by `host_request`.
//!
//! Values are part of the guest ABI: guests compile them in independently
//! of the host, so new opcodes are appended and existing ones never change.

use std::fmt;

use guestbox_common::HostFunctionError;

/// Privileged operation requested by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum OpCode {
    Fetch = 1,
    DbQuery = 2,
    KvGet = 3,
    KvSet = 4,
    SecretGet = 5,
    JobEnqueue = 6,
    FileRead = 7,
    FileSave = 8,
    VectorSearch = 9,
    TxBegin = 10,
    TxCommit = 11,
    TxRollback = 12,
    Utils = 13,
}

impl OpCode {
    /// Every opcode, in numeric order.
    pub const ALL: [OpCode; 13] = [
        OpCode::Fetch,
        OpCode::DbQuery,
        OpCode::KvGet,
        OpCode::KvSet,
        OpCode::SecretGet,
        OpCode::JobEnqueue,
        OpCode::FileRead,
        OpCode::FileSave,
        OpCode::VectorSearch,
        OpCode::TxBegin,
        OpCode::TxCommit,
        OpCode::TxRollback,
        OpCode::Utils,
    ];

    /// The raw ABI value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Stable lowercase name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Fetch => "fetch",
            OpCode::DbQuery => "db_query",
            OpCode::KvGet => "kv_get",
            OpCode::KvSet => "kv_set",
            OpCode::SecretGet => "secret_get",
            OpCode::JobEnqueue => "job_enqueue",
            OpCode::FileRead => "file_read",
            OpCode::FileSave => "file_save",
            OpCode::VectorSearch => "vector_search",
            OpCode::TxBegin => "tx_begin",
            OpCode::TxCommit => "tx_commit",
            OpCode::TxRollback => "tx_rollback",
            OpCode::Utils => "utils",
        }
    }
}

impl TryFrom<u32> for OpCode {
    type Error = HostFunctionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        OpCode::ALL
            .get((value as usize).wrapping_sub(1))
            .copied()
            .ok_or(HostFunctionError::HandlerNotRegistered { op: value })
    }
}

impl From<OpCode> for u32 {
    fn from(op: OpCode) -> Self {
        op.as_u32()
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u32())
    }
}
