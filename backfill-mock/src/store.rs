use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use backfill_core::{BackfillError, Bar, LocalStore, Timeframe};

/// In-memory `LocalStore` with a save counter and a failure switch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: Mutex<HashMap<(String, Timeframe), Vec<Bar>>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored series, if any.
    #[must_use]
    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Bar>> {
        self.lock().get(&(symbol.to_string(), timeframe)).cloned()
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail with a persistence error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, Timeframe), Vec<Bar>>> {
        self.series
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl LocalStore for MemoryStore {
    fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Vec<Bar>>, BackfillError> {
        Ok(self.get(symbol, timeframe))
    }

    fn save(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Result<(), BackfillError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(BackfillError::Persistence(format!(
                "memory store refused {symbol}/{timeframe}"
            )));
        }
        self.lock()
            .insert((symbol.to_string(), timeframe), bars.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
