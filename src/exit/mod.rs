// =============================================================================
// Exit management — staged take-profits and the reversal monitor
// =============================================================================
//
// Both executors serialise their writes per (symbol, side) through the same
// store-backed distributed lock and the same 30-second recent-close guard.
// =============================================================================

pub mod divergence;
pub mod partial_tp;
pub mod reversal;

pub use partial_tp::{PartialTpExecutor, StageOutcome};
pub use reversal::{ReversalAssessment, ReversalMonitor, ReversalTier};
