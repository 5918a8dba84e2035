//! Default limits and timings

use std::time::Duration;

/// Nodes at this nest level or deeper are counted as skipped and not entered.
pub const MAX_NEST_DEPTH: usize = 5;
/// Inset applied to each side, as a fraction of width (x) and height (y).
pub const MARGIN_RATIO: f64 = 0.05;
/// Boundaries thinner than this on either axis are replaced by the fallback square.
pub const DEGENERATE_THRESHOLD: f64 = 1e-3;
/// Half side of the fallback square around the insertion point.
pub const FALLBACK_HALF_SIZE: f64 = 5.0;
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const VERIFY_ATTEMPTS: u32 = 5;
/// Backoff after failed verification attempt `n` is `VERIFY_BACKOFF * n`.
pub const VERIFY_BACKOFF: Duration = Duration::from_millis(500);
/// Decimal places of coordinates in the command string.
pub const COORD_PRECISION: usize = 6;
/// Failed names listed in a batch summary before "and N more".
pub const MAX_LISTED_FAILURES: usize = 10;
