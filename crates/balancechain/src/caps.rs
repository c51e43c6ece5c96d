//! The caps accountant: calendar-windowed quota counters.
//!
//! Four counters per identity (daily / monthly / yearly / total). The
//! periodic counters reset at UTC calendar boundaries: midnight, the first
//! of the next month, January 1 of the next year. Resets are applied
//! lazily on read, persisted before the counter is exposed, so replayed
//! reads after a restart see the same values.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::debug;

use balancechain_core::consts::{DAILY_CAP, INITIAL_UNLOCKED, MONTHLY_CAP, YEARLY_CAP};
use balancechain_core::Hid;
use balancechain_store::{CapsPeriod, CapsRow, Store};

use crate::clock::Clock;
use crate::error::Result;
use crate::validator::{Reason, RuleFailure};

/// The four counters for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsState {
    pub daily: CapsRow,
    pub monthly: CapsRow,
    pub yearly: CapsRow,
    pub total: CapsRow,
}

impl CapsState {
    /// A zeroed state with reset boundaries computed from `now`.
    pub fn fresh(now_ms: i64) -> Self {
        Self {
            daily: CapsRow {
                count: 0,
                resets_at: Some(next_day_utc(now_ms)),
            },
            monthly: CapsRow {
                count: 0,
                resets_at: Some(next_month_utc(now_ms)),
            },
            yearly: CapsRow {
                count: 0,
                resets_at: Some(next_year_utc(now_ms)),
            },
            total: CapsRow {
                count: 0,
                resets_at: None,
            },
        }
    }

    fn row(&self, period: CapsPeriod) -> CapsRow {
        match period {
            CapsPeriod::Daily => self.daily,
            CapsPeriod::Monthly => self.monthly,
            CapsPeriod::Yearly => self.yearly,
            CapsPeriod::Total => self.total,
        }
    }

    /// Rows in store form, for persisting.
    pub fn rows(&self, hid: &Hid) -> Vec<(CapsPeriod, Hid, CapsRow)> {
        CapsPeriod::all()
            .into_iter()
            .map(|p| (p, hid.clone(), self.row(p)))
            .collect()
    }
}

/// Remaining headroom under each periodic cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsAvailable {
    pub daily: u64,
    pub monthly: u64,
    pub yearly: u64,
}

/// UTC midnight after the given instant.
pub fn next_day_utc(now_ms: i64) -> i64 {
    let date = utc_date(now_ms);
    let next = date.succ_opt().expect("valid calendar date");
    midnight_ms(next)
}

/// First of the next month, UTC.
pub fn next_month_utc(now_ms: i64) -> i64 {
    let date = utc_date(now_ms);
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let next = NaiveDate::from_ymd_opt(year, month, 1).expect("valid calendar date");
    midnight_ms(next)
}

/// January 1 of the next year, UTC.
pub fn next_year_utc(now_ms: i64) -> i64 {
    let date = utc_date(now_ms);
    let next = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).expect("valid calendar date");
    midnight_ms(next)
}

fn utc_date(now_ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(now_ms)
        .expect("timestamp in range")
        .date_naive()
}

fn midnight_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .expect("valid calendar date")
        .and_utc()
        .timestamp_millis()
}

/// Apply a cap-checked increment of `n`, returning the new state.
pub fn checked_increment(
    state: &CapsState,
    n: u64,
) -> std::result::Result<CapsState, RuleFailure> {
    let checks = [
        (state.daily.count, DAILY_CAP, Reason::DailyCapExceeded),
        (state.monthly.count, MONTHLY_CAP, Reason::MonthlyCapExceeded),
        (state.yearly.count, YEARLY_CAP, Reason::YearlyCapExceeded),
    ];
    for (count, cap, reason) in checks {
        if count + n > cap {
            return Err(RuleFailure::new(
                2,
                reason,
                format!("counter {count} + {n} exceeds cap {cap}"),
            ));
        }
    }

    let mut next = *state;
    next.daily.count += n;
    next.monthly.count += n;
    next.yearly.count += n;
    next.total.count += n;
    Ok(next)
}

/// The caps accountant for all identities in this store.
pub struct CapsAccountant {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, CapsState>>,
}

impl CapsAccountant {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Current counters, with any pending calendar reset applied and
    /// persisted before the value is exposed.
    pub async fn current(&self, hid: &Hid) -> Result<CapsState> {
        let now = self.clock.now_ms();

        let cached = self
            .cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(hid.as_str()).copied());

        let mut state = match cached {
            Some(state) => state,
            None => self.load(hid).await?.unwrap_or_else(|| CapsState::fresh(now)),
        };

        let mut fired = false;
        for (row, next_boundary) in [
            (&mut state.daily, next_day_utc as fn(i64) -> i64),
            (&mut state.monthly, next_month_utc),
            (&mut state.yearly, next_year_utc),
        ] {
            if let Some(resets_at) = row.resets_at {
                if resets_at <= now {
                    row.count = 0;
                    row.resets_at = Some(next_boundary(now));
                    fired = true;
                }
            }
        }

        if fired {
            debug!(hid = %hid, "caps window reset");
            self.persist(hid, &state).await?;
        }
        self.note_committed(hid, state);
        Ok(state)
    }

    /// Increment all four counters by `n` after validating the caps.
    pub async fn increment(&self, hid: &Hid, n: u64) -> Result<CapsState> {
        let state = self.current(hid).await?;
        let next = checked_increment(&state, n)?;
        self.persist(hid, &next).await?;
        self.note_committed(hid, next);
        Ok(next)
    }

    /// Remaining headroom under each periodic cap.
    pub async fn available(&self, hid: &Hid) -> Result<CapsAvailable> {
        let state = self.current(hid).await?;
        Ok(CapsAvailable {
            daily: DAILY_CAP.saturating_sub(state.daily.count),
            monthly: MONTHLY_CAP.saturating_sub(state.monthly.count),
            yearly: YEARLY_CAP.saturating_sub(state.yearly.count),
        })
    }

    /// Unlocked capacity: the initial grant plus everything ever spent.
    pub async fn unlocked_balance(&self, hid: &Hid) -> Result<u64> {
        let state = self.current(hid).await?;
        Ok(INITIAL_UNLOCKED + state.total.count)
    }

    /// Drop the cached state for an identity.
    pub fn invalidate(&self, hid: &Hid) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(hid.as_str());
        }
    }

    /// Record a state the chain just persisted atomically.
    pub fn note_committed(&self, hid: &Hid, state: CapsState) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(hid.as_str().to_string(), state);
        }
    }

    async fn load(&self, hid: &Hid) -> Result<Option<CapsState>> {
        let daily = self.store.get_caps_row(CapsPeriod::Daily, hid).await?;
        let monthly = self.store.get_caps_row(CapsPeriod::Monthly, hid).await?;
        let yearly = self.store.get_caps_row(CapsPeriod::Yearly, hid).await?;
        let total = self.store.get_caps_row(CapsPeriod::Total, hid).await?;

        if daily.is_none() && monthly.is_none() && yearly.is_none() && total.is_none() {
            return Ok(None);
        }

        let now = self.clock.now_ms();
        let fresh = CapsState::fresh(now);
        Ok(Some(CapsState {
            daily: daily.unwrap_or(fresh.daily),
            monthly: monthly.unwrap_or(fresh.monthly),
            yearly: yearly.unwrap_or(fresh.yearly),
            total: total.unwrap_or(fresh.total),
        }))
    }

    async fn persist(&self, hid: &Hid, state: &CapsState) -> Result<()> {
        for (period, hid, row) in state.rows(hid) {
            self.store.put_caps_row(period, &hid, &row).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancechain_store::MemoryStore;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct TestClock(AtomicI64);

    impl Clock for TestClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    // 2025-01-14T12:00:00Z
    const NOON: i64 = 1_736_856_000_000;

    fn setup(now: i64) -> (Arc<TestClock>, CapsAccountant) {
        let clock = Arc::new(TestClock(AtomicI64::new(now)));
        let accountant = CapsAccountant::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (clock, accountant)
    }

    fn hid() -> Hid {
        Hid::parse("HID-1A2B3C4D").unwrap()
    }

    #[test]
    fn test_calendar_boundaries() {
        // 2025-01-14T12:00Z -> midnight Jan 15, Feb 1, Jan 1 2026
        assert_eq!(next_day_utc(NOON), 1_736_899_200_000);
        assert_eq!(next_month_utc(NOON), 1_738_368_000_000);
        assert_eq!(next_year_utc(NOON), 1_767_225_600_000);
    }

    #[test]
    fn test_december_rolls_into_next_year() {
        // 2025-12-15T00:00:00Z
        let december = 1_765_756_800_000;
        let month_boundary = next_month_utc(december);
        let year_boundary = next_year_utc(december);
        assert_eq!(month_boundary, year_boundary);
    }

    #[tokio::test]
    async fn test_increment_and_available() {
        let (_clock, accountant) = setup(NOON);
        let hid = hid();

        let state = accountant.increment(&hid, 1).await.unwrap();
        assert_eq!(state.daily.count, 1);
        assert_eq!(state.total.count, 1);

        let available = accountant.available(&hid).await.unwrap();
        assert_eq!(available.daily, DAILY_CAP - 1);
    }

    #[tokio::test]
    async fn test_daily_cap_enforced() {
        let (_clock, accountant) = setup(NOON);
        let hid = hid();

        accountant.increment(&hid, DAILY_CAP).await.unwrap();
        let result = accountant.increment(&hid, 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_daily_reset_at_midnight() {
        let (clock, accountant) = setup(NOON);
        let hid = hid();

        accountant.increment(&hid, 5).await.unwrap();

        // Cross midnight UTC
        clock.0.store(next_day_utc(NOON) + 1000, Ordering::SeqCst);

        let state = accountant.current(&hid).await.unwrap();
        assert_eq!(state.daily.count, 0);
        assert_eq!(state.monthly.count, 5);
        assert_eq!(state.total.count, 5);

        // Reset boundary advanced past the new now
        assert!(state.daily.resets_at.unwrap() > clock.now_ms());
    }

    #[tokio::test]
    async fn test_reset_persisted_before_exposed() {
        let (clock, accountant) = setup(NOON);
        let hid = hid();
        accountant.increment(&hid, 3).await.unwrap();
        clock.0.store(next_day_utc(NOON) + 1, Ordering::SeqCst);
        accountant.current(&hid).await.unwrap();

        // A second accountant over the same store sees the reset row
        let store = Arc::clone(&accountant.store);
        let other = CapsAccountant::new(store, Arc::clone(&clock) as Arc<dyn Clock>);
        let state = other.current(&hid).await.unwrap();
        assert_eq!(state.daily.count, 0);
        assert_eq!(state.total.count, 3);
    }

    #[tokio::test]
    async fn test_unlocked_balance() {
        let (_clock, accountant) = setup(NOON);
        let hid = hid();

        assert_eq!(
            accountant.unlocked_balance(&hid).await.unwrap(),
            INITIAL_UNLOCKED
        );
        accountant.increment(&hid, 7).await.unwrap();
        assert_eq!(
            accountant.unlocked_balance(&hid).await.unwrap(),
            INITIAL_UNLOCKED + 7
        );
    }
}
