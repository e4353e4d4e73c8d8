use thiserror::Error;

use crate::chunk::ChunkId;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  /// Rejected before touching any allocator state.
  #[error("invalid {what}: {reason}")]
  InvalidArgument { what: &'static str, reason: String },

  /// The backing memory provider could not hand out a block.
  #[error("backing memory exhausted while reserving {requested} bytes")]
  AllocationExhausted { requested: usize },

  /// A free (or internal bookkeeping) that does not match a live reservation.
  #[error("allocator invariant violated: {0}")]
  InvariantViolation(#[from] Violation),
}

impl Error {
  pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
    Self::InvalidArgument {
      what,
      reason: reason.into(),
    }
  }
}

/// What exactly a rejected free (or lookup) got wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
  #[error("chunk {0:?} is not owned by this arena")]
  UnknownChunk(ChunkId),

  #[error("node {node} of chunk {chunk:?} is not an allocated run")]
  NotAllocated { chunk: ChunkId, node: usize },

  #[error("slot {slot} of page {page} is not allocated")]
  SlotNotAllocated { page: usize, slot: usize },

  #[error("size mismatch: region holds {expected} bytes, free claimed {actual}")]
  SizeMismatch { expected: usize, actual: usize },

  #[error("page {page} is not an active subpage")]
  SubpageInactive { page: usize },

  #[error("handle {handle:#018x} is out of range for this chunk")]
  HandleOutOfRange { handle: u64 },

  #[error("region belongs to arena #{owner}, not arena #{arena}")]
  ForeignRegion { owner: u64, arena: u64 },

  #[error("buddy tree of chunk {chunk:?} is inconsistent: {detail}")]
  TreeCorrupted { chunk: ChunkId, detail: String },

  #[error("{0}")]
  Corrupted(&'static str),
}
