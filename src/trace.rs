use anyhow::{Error, bail};

pub(crate) mod encoder;
pub(crate) mod parser;

/// Wire discriminator of a [`TraceRecord::Branch`].
const BRANCH_TYPE_ID: u8 = 1;
/// Wire discriminator of a [`TraceRecord::HeapAllocation`].
const HEAP_ALLOCATION_TYPE_ID: u8 = 2;
/// Wire discriminator of a [`TraceRecord::HeapMemoryAccess`].
const HEAP_MEMORY_ACCESS_TYPE_ID: u8 = 3;

/// The kind of control-flow transfer recorded by a branch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Jump,
    Call,
    Return,
}

impl BranchKind {
    /// Returns the integer that identifies this branch kind on the wire.
    pub fn id(&self) -> u8 {
        match self {
            BranchKind::Jump => 0,
            BranchKind::Call => 1,
            BranchKind::Return => 2,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(BranchKind::Jump),
            1 => Ok(BranchKind::Call),
            2 => Ok(BranchKind::Return),
            _ => bail!("branch kind {id} was not recognized"),
        }
    }
}

/// One entry of a preprocessed binary trace.
///
/// Addresses are 32-bit values relative to their owning image: packed
/// `(line, column)` pairs for script positions, serial ids for external
/// functions and synthetic offsets for heap properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRecord {
    Branch {
        source_image: i32,
        source_address: u32,
        destination_image: i32,
        destination_address: u32,
        taken: bool,
        kind: BranchKind,
    },
    HeapAllocation {
        id: i32,
        address: u64,
        size: u32,
    },
    HeapMemoryAccess {
        instruction_image: i32,
        instruction_address: u32,
        allocation_id: i32,
        memory_address: u32,
        size: u32,
        is_write: bool,
    },
}

impl TraceRecord {
    /// Returns the wire discriminator of this record.
    pub fn type_id(&self) -> u8 {
        match self {
            TraceRecord::Branch { .. } => BRANCH_TYPE_ID,
            TraceRecord::HeapAllocation { .. } => HEAP_ALLOCATION_TYPE_ID,
            TraceRecord::HeapMemoryAccess { .. } => HEAP_MEMORY_ACCESS_TYPE_ID,
        }
    }
}

/// Descriptor of a loaded script as stored in the prefix trace header.
///
/// `start` and `end` delimit the virtual address window of the image;
/// relative addresses of the image map into this window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: i32,
    pub interesting: bool,
    pub start: u64,
    pub end: u64,
    pub name: String,
}
