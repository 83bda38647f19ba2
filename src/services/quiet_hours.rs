//! Quiet-hours evaluation. Pure functions over a window and a UTC instant.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::db::models::QuietHoursWindow;

/// Whether `now_utc` falls inside the window, evaluated in the window's timezone.
///
/// Same-day windows hold for `start <= t < end`; wrapping windows for
/// `t >= start || t < end`. A zero-width window (`start == end`) never holds.
pub fn is_in_quiet_hours(window: &QuietHoursWindow, now_utc: DateTime<Utc>) -> bool {
    if window.is_disabled() {
        return false;
    }

    let local = now_utc.with_timezone(&window.timezone).time();
    if window.wraps_midnight() {
        local >= window.start || local < window.end
    } else {
        window.start <= local && local < window.end
    }
}

/// The UTC instant at which the window containing `now_utc` closes.
///
/// Returns `None` when `now_utc` is not inside quiet hours.
pub fn quiet_hours_end(window: &QuietHoursWindow, now_utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !is_in_quiet_hours(window, now_utc) {
        return None;
    }

    let local = now_utc.with_timezone(&window.timezone);
    let mut end_date = local.date_naive();
    // In the evening half of a wrapping window the end is tomorrow morning.
    if window.wraps_midnight() && local.time() >= window.start {
        end_date = end_date.succ_opt()?;
    }

    let end_local = end_date.and_time(window.end);
    Some(resolve_local(&window.timezone, end_local)?.with_timezone(&Utc))
}

/// Map a wall-clock time to an instant. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward to the first valid minute.
fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => (1..=180)
            .map(|m| local + Duration::minutes(m))
            .find_map(|candidate| tz.from_local_datetime(&candidate).earliest()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn same_day_window() {
        let window = QuietHoursWindow::parse("13:00", "15:00", "UTC").unwrap();
        assert!(!is_in_quiet_hours(&window, utc(2024, 3, 1, 12, 59)));
        assert!(is_in_quiet_hours(&window, utc(2024, 3, 1, 13, 0)));
        assert!(is_in_quiet_hours(&window, utc(2024, 3, 1, 14, 59)));
        // End is exclusive.
        assert!(!is_in_quiet_hours(&window, utc(2024, 3, 1, 15, 0)));
    }

    #[test]
    fn window_wrapping_midnight() {
        let window = QuietHoursWindow::parse("22:00", "07:00", "UTC").unwrap();
        assert!(is_in_quiet_hours(&window, utc(2024, 3, 1, 22, 0)));
        assert!(is_in_quiet_hours(&window, utc(2024, 3, 1, 23, 30)));
        assert!(is_in_quiet_hours(&window, utc(2024, 3, 2, 3, 0)));
        assert!(!is_in_quiet_hours(&window, utc(2024, 3, 2, 7, 0)));
        assert!(!is_in_quiet_hours(&window, utc(2024, 3, 2, 12, 0)));
    }

    #[test]
    fn zero_width_window_is_disabled() {
        let window = QuietHoursWindow::parse("09:00", "09:00", "UTC").unwrap();
        for hour in 0..24 {
            assert!(!is_in_quiet_hours(&window, utc(2024, 3, 1, hour, 0)));
        }
        assert!(quiet_hours_end(&window, utc(2024, 3, 1, 9, 0)).is_none());
    }

    #[test]
    fn evaluates_in_the_users_timezone() {
        // 22:00-07:00 in New York (UTC-4 in June).
        let window = QuietHoursWindow::parse("22:00", "07:00", "America/New_York").unwrap();
        // 03:00 UTC is 23:00 in New York.
        assert!(is_in_quiet_hours(&window, utc(2024, 6, 10, 3, 0)));
        // 15:00 UTC is 11:00 in New York.
        assert!(!is_in_quiet_hours(&window, utc(2024, 6, 10, 15, 0)));
    }

    #[test]
    fn end_of_wrapping_window() {
        let window = QuietHoursWindow::parse("22:00", "07:00", "Asia/Tokyo").unwrap();
        // 14:00 UTC is 23:00 in Tokyo; window closes 07:00 Tokyo = 22:00 UTC.
        assert_eq!(
            quiet_hours_end(&window, utc(2024, 6, 10, 14, 0)),
            Some(utc(2024, 6, 10, 22, 0))
        );
        // 18:00 UTC is 03:00 next day in Tokyo; same close instant.
        assert_eq!(
            quiet_hours_end(&window, utc(2024, 6, 10, 18, 0)),
            Some(utc(2024, 6, 10, 22, 0))
        );
        assert!(quiet_hours_end(&window, utc(2024, 6, 10, 3, 0)).is_none());
    }

    #[test]
    fn end_of_same_day_window() {
        let window = QuietHoursWindow::parse("12:00", "14:30", "UTC").unwrap();
        assert_eq!(
            quiet_hours_end(&window, utc(2024, 6, 10, 13, 0)),
            Some(utc(2024, 6, 10, 14, 30))
        );
    }

    #[test]
    fn end_inside_dst_gap_moves_forward() {
        // Clocks in New York jump 02:00 -> 03:00 on 2024-03-10.
        let window = QuietHoursWindow::parse("23:00", "02:30", "America/New_York").unwrap();
        // 05:00 UTC on 2024-03-10 is 00:00 EST.
        let end = quiet_hours_end(&window, utc(2024, 3, 10, 5, 0)).unwrap();
        // First valid local time after the gap is 03:00 EDT = 07:00 UTC.
        assert_eq!(end, utc(2024, 3, 10, 7, 0));
    }
}
