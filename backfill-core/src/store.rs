use crate::bar::Bar;
use crate::types::{BackfillError, Timeframe};

/// Local bar store. The on-disk format is the implementor's business.
pub trait LocalStore: Send + Sync {
    /// Load the stored series, or `None` when nothing is stored yet.
    ///
    /// # Errors
    /// Returns `Persistence` when stored data exists but cannot be read.
    fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Vec<Bar>>, BackfillError>;

    /// Replace the stored series.
    ///
    /// # Errors
    /// Returns `Persistence` when the series cannot be written.
    fn save(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Result<(), BackfillError>;
}
