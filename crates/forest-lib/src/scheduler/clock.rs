//! Wall-clock time for the scheduler

use chrono::{
    DateTime, FixedOffset, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};

/// Source of wall-clock time in some local timezone
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// First instant strictly after `after` whose local time of day is `at`
    fn next_fire(&self, after: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc>;

    /// Local calendar date of `instant`
    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate;
}

/// The host's clock and timezone
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn next_fire(&self, after: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
        next_fire_after(&Local, after, at)
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&Local).date_naive()
    }
}

/// Clock at a fixed UTC offset that starts at `anchor` and advances with
/// tokio's clock, so paused-time tests move it deterministically
#[derive(Debug, Clone)]
pub struct OffsetClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
    offset: FixedOffset,
}

impl OffsetClock {
    pub fn new(anchor: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
            offset,
        }
    }

    pub fn utc(anchor: DateTime<Utc>) -> Self {
        Self::new(anchor, Utc.fix())
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }

    fn next_fire(&self, after: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
        next_fire_after(&self.offset, after, at)
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }
}

/// Next occurrence of local time `at` in `tz` strictly after `after`
///
/// A time skipped by a DST gap fires an hour later; a repeated time fires on
/// its first occurrence.
pub fn next_fire_after<Tz: TimeZone>(tz: &Tz, after: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let mut day = after.with_timezone(tz).date_naive();

    for _ in 0..4 {
        if let Some(fire) = resolve_local(tz, day.and_time(at)) {
            if fire > after {
                return fire;
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    after + chrono::Duration::days(1)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn eight() -> NaiveTime {
        NaiveTime::from_hms_opt(8, 0, 0).unwrap()
    }

    #[test]
    fn test_next_fire_later_today() {
        let fire = next_fire_after(&Utc, utc("2024-01-01T07:00:00Z"), eight());
        assert_eq!(fire, utc("2024-01-01T08:00:00Z"));
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let fire = next_fire_after(&Utc, utc("2024-01-01T08:00:00Z"), eight());
        assert_eq!(fire, utc("2024-01-02T08:00:00Z"));
    }

    #[test]
    fn test_missed_fire_is_not_made_up() {
        // Process came up at 09:00; the 08:00 slot is gone until tomorrow
        let fire = next_fire_after(&Utc, utc("2024-01-01T09:00:00Z"), eight());
        assert_eq!(fire, utc("2024-01-02T08:00:00Z"));
    }

    #[test]
    fn test_next_fire_uses_local_offset() {
        let cest = FixedOffset::east_opt(2 * 3600).unwrap();
        // 07:00Z is 09:00 local, past today's 08:00 local
        let fire = next_fire_after(&cest, utc("2024-06-01T07:00:00Z"), eight());
        assert_eq!(fire, utc("2024-06-02T06:00:00Z"));
    }

    #[test]
    fn test_local_date_crosses_midnight() {
        let clock = OffsetClock::new(utc("2024-01-01T00:00:00Z"), FixedOffset::west_opt(5 * 3600).unwrap());
        assert_eq!(
            clock.local_date(utc("2024-01-01T03:00:00Z")),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_clock_follows_tokio_time() {
        let clock = OffsetClock::utc(utc("2024-01-01T07:59:00Z"));
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now(), utc("2024-01-01T08:00:30Z"));
    }
}
