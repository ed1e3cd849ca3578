use thiserror::Error;

/// Failure of the arena-growth collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ArenaError {
  #[error("arena exhausted: requested {requested} bytes, {remaining} remaining")]
  Exhausted { requested: usize, remaining: usize },
  #[error("mmap reservation of {0} bytes failed")]
  MapFailed(usize),
  /// Boundary tags and free-list links are 32-bit offsets.
  #[error("arena would grow past the 32-bit offset range")]
  OffsetRange,
}

/// Rejected tuning parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("fit_candidates must be at least 1")]
  FitCandidates,
  #[error("realloc_slack must be a multiple of 8, got {0}")]
  ReallocSlack(usize),
  #[error("initial_buffer must be a non-zero multiple of 8, got {0}")]
  InitialBuffer(usize),
  #[error("grow_granularity must be a power of two >= 8, got {0}")]
  GrowGranularity(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HeapError {
  #[error(transparent)]
  Arena(#[from] ArenaError),
  #[error("invalid config: {0}")]
  Config(#[from] ConfigError),
  #[error("zero-sized request")]
  ZeroSize,
}
