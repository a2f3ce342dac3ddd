pub mod fill;
pub mod generate;
pub mod rates;
pub mod rescue;
pub mod testmode;

pub use fill::{parse_filltypes, FillOptions, FillSummary, Fillbook};
pub use generate::{Genbook, GenerateOptions, GenerateSummary};
pub use rescue::{MinReadRate, RescueOptions, RescueSummary, Rescuebook};
pub use testmode::TestModeInput;

use frescue_error::{RescueError, Result};

/// Map an input position to the output, honoring a possibly negative
/// constant offset.
pub(crate) fn apply_offset(pos: u64, offset: i64) -> Result<u64> {
    let shifted = pos as i128 + offset as i128;
    u64::try_from(shifted)
        .map_err(|_| RescueError::internal(format!("output position underflow at {pos}")))
}
