//! In-memory month-to-date spend per provider.
//!
//! Amounts are kept in micro-dollars so concurrent additions are exact
//! integer sums. The aggregate is tagged with the calendar month it covers;
//! the ledger replaces it wholesale when the month rolls over.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Convert a dollar amount to micro-dollars, clamping negatives to zero.
pub fn dollars_to_micros(dollars: f64) -> u64 {
    if !dollars.is_finite() || dollars <= 0.0 {
        return 0;
    }
    (dollars * MICROS_PER_DOLLAR).round() as u64
}

pub fn micros_to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}

/// A UTC calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now())
    }

    fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Half-open `[start, end)` window in unix milliseconds.
    pub fn window_ms(&self) -> Option<(i64, i64)> {
        let start = self.first_day()?.and_hms_opt(0, 0, 0)?;
        let end = self.next().first_day()?.and_hms_opt(0, 0, 0)?;
        Some((
            Utc.from_utc_datetime(&start).timestamp_millis(),
            Utc.from_utc_datetime(&end).timestamp_millis(),
        ))
    }
}

#[derive(Debug)]
struct State {
    month: MonthKey,
    micros: HashMap<String, u64>,
}

/// Per-provider spend for one month, guarded by a single mutex.
#[derive(Debug)]
pub struct MonthlyAggregate {
    state: Mutex<State>,
}

impl MonthlyAggregate {
    pub fn new(month: MonthKey) -> Self {
        Self {
            state: Mutex::new(State {
                month,
                micros: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn month(&self) -> MonthKey {
        self.lock().month
    }

    /// Add spend recorded at `ts`. Entries outside the tracked month are ignored.
    pub fn add(&self, provider: &str, cost_usd: f64, ts: DateTime<Utc>) -> bool {
        let micros = dollars_to_micros(cost_usd);
        let mut state = self.lock();
        if MonthKey::of(ts) != state.month {
            return false;
        }
        *state.micros.entry(provider.to_string()).or_insert(0) += micros;
        true
    }

    /// Swap in a freshly rebuilt month.
    pub fn replace(&self, month: MonthKey, micros: HashMap<String, u64>) {
        let mut state = self.lock();
        state.month = month;
        state.micros = micros;
    }

    pub fn spent(&self, provider: &str) -> f64 {
        micros_to_dollars(self.lock().micros.get(provider).copied().unwrap_or(0))
    }

    pub fn to_dollars(&self) -> HashMap<String, f64> {
        self.lock()
            .micros
            .iter()
            .map(|(provider, micros)| (provider.clone(), micros_to_dollars(*micros)))
            .collect()
    }
}
