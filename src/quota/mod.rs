mod store;

pub use store::{FileQuotaStore, InMemoryQuotaStore, QuotaStore, Scope};

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{info, warn};

use crate::error::StoreError;

/// Free-tier ceiling of map-session loads per calendar month
pub const FREE_TIER_CEILING: u32 = 50_000;

/// Remaining loads at which the governor starts warning
pub const WARNING_THRESHOLD: u32 = 1_000;

const MONTH_KEY: &str = "map_loads_month";
const COUNT_KEY: &str = "map_loads_count";
const SESSION_KEY: &str = "map_session_initialized";

/// Source of the current calendar month tag
pub trait Clock {
    /// Month tag such as "2026-10"; compared for equality only
    fn current_month(&self) -> String;
}

/// Local wall-clock month
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_month(&self) -> String {
        let now = Local::now();
        month_tag(now.year(), now.month())
    }
}

/// Month under caller control; clones share the same month
#[derive(Debug, Clone)]
pub struct ManualClock {
    month: Rc<Cell<(i32, u32)>>,
}

impl ManualClock {
    pub fn new(year: i32, month: u32) -> Self {
        Self {
            month: Rc::new(Cell::new((year, month))),
        }
    }

    pub fn set(&self, year: i32, month: u32) {
        self.month.set((year, month));
    }
}

impl Clock for ManualClock {
    fn current_month(&self) -> String {
        let (year, month) = self.month.get();
        month_tag(year, month)
    }
}

fn month_tag(year: i32, month: u32) -> String {
    format!("{year}-{month}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub ceiling: u32,
    pub warning_threshold: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            ceiling: FREE_TIER_CEILING,
            warning_threshold: WARNING_THRESHOLD,
        }
    }
}

/// Stored quota data as of one read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaState {
    pub month: String,
    pub count: u32,
    pub session_initialized: bool,
}

/// Where the governor sits relative to its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPhase {
    /// No session spent by this process yet, below the warning window
    Idle,
    /// A session has been spent, still below the warning window
    PermittedBelowCeiling,
    /// Within the warning window but below the ceiling
    Warning,
    /// At or above the ceiling; new sessions are refused
    Exceeded,
}

/// Calendar-month counter of map-session initializations.
/// Every increment goes through here; the month rolls over before any read or write.
pub struct QuotaGovernor<S: QuotaStore, C: Clock = SystemClock> {
    store: S,
    clock: C,
    limits: QuotaLimits,
}

impl<S: QuotaStore> QuotaGovernor<S, SystemClock> {
    pub fn new(store: S, limits: QuotaLimits) -> Self {
        Self::with_clock(store, SystemClock, limits)
    }
}

impl<S: QuotaStore, C: Clock> QuotaGovernor<S, C> {
    pub fn with_clock(store: S, clock: C, limits: QuotaLimits) -> Self {
        Self { store, clock, limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn stored_count(&self) -> Result<u32, StoreError> {
        let raw = self.store.get(Scope::Persistent, COUNT_KEY)?;
        Ok(match raw.as_deref().map(str::parse::<u32>) {
            Some(Ok(count)) => count,
            Some(Err(_)) => {
                warn!(value = ?raw, "unreadable map load counter, treating as zero");
                0
            }
            None => 0,
        })
    }

    /// Reset the counter if the stored month tag is not the current month.
    /// Returns the current month tag.
    fn roll_over(&mut self) -> Result<String, StoreError> {
        let month = self.clock.current_month();
        let stored = self.store.get(Scope::Persistent, MONTH_KEY)?;
        if stored.as_deref() != Some(month.as_str()) {
            info!(previous = ?stored, current = %month, "new month, resetting map load counter");
            // counter first: a failed month write leaves the old tag and the next read rolls over again
            self.store
                .set_many(Scope::Persistent, &[(COUNT_KEY, "0"), (MONTH_KEY, &month)])?;
        }
        Ok(month)
    }

    /// Current month's load count
    pub fn get_count(&mut self) -> Result<u32, StoreError> {
        self.roll_over()?;
        self.stored_count()
    }

    /// Record one session initialization attempt and mark this process as having spent its session
    pub fn increment(&mut self) -> Result<u32, StoreError> {
        self.roll_over()?;
        self.store.set(Scope::Session, SESSION_KEY, "true")?;
        let count = self.stored_count()?.saturating_add(1);
        self.store.set(Scope::Persistent, COUNT_KEY, &count.to_string())?;
        info!(count, ceiling = self.limits.ceiling, "map load count incremented");
        Ok(count)
    }

    pub fn should_permit_init(&mut self) -> Result<bool, StoreError> {
        Ok(self.get_count()? < self.limits.ceiling)
    }

    /// True inside the warning window. A stale month never warns and is not rolled over here.
    pub fn should_warn(&self) -> Result<bool, StoreError> {
        let month = self.clock.current_month();
        if self.store.get(Scope::Persistent, MONTH_KEY)?.as_deref() != Some(month.as_str()) {
            return Ok(false);
        }
        let remaining = self.limits.ceiling.saturating_sub(self.stored_count()?);
        Ok(remaining <= self.limits.warning_threshold)
    }

    pub fn session_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(Scope::Session, SESSION_KEY)?.as_deref() == Some("true"))
    }

    /// Clear only the in-process session flag; the monthly counter is untouched
    pub fn reset_session_flag(&mut self) -> Result<(), StoreError> {
        self.store.remove(Scope::Session, SESSION_KEY)?;
        info!("reset map session initialization flag");
        Ok(())
    }

    pub fn state(&mut self) -> Result<QuotaState, StoreError> {
        let month = self.roll_over()?;
        Ok(QuotaState {
            month,
            count: self.stored_count()?,
            session_initialized: self.session_initialized()?,
        })
    }

    pub fn phase(&mut self) -> Result<QuotaPhase, StoreError> {
        let state = self.state()?;
        Ok(if state.count >= self.limits.ceiling {
            QuotaPhase::Exceeded
        } else if self.should_warn()? {
            QuotaPhase::Warning
        } else if state.session_initialized {
            QuotaPhase::PermittedBelowCeiling
        } else {
            QuotaPhase::Idle
        })
    }
}
