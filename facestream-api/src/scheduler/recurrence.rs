/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Pure schedule-window evaluation. All decisions take an explicit `now`
//! in the server zone, so tests sweep simulated clocks.

use chrono::{DateTime, Datelike, NaiveTime, Timelike};
use chrono_tz::Tz;

use crate::persistence::{EventSchedule, Recurrence};

/// True when a wall-clock time falls inside the window. The start minute is
/// part of the window, the end minute is not, so a session stops on the
/// tick that first sees the end time. `end < start` wraps past midnight:
/// (start..24:00) ∪ (00:00..end).
pub fn window_contains(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

/// Whether an event should be running at `now`.
///
/// Date-gated recurrences (Once/Weekly/Monthly) anchor on the calendar day
/// the window started: past midnight inside a wrapped window, yesterday is
/// the day that must match.
pub fn event_active_at(event: &EventSchedule, now: DateTime<Tz>) -> bool {
    if !event.active {
        return false;
    }
    let time = now.time().with_nanosecond(0).unwrap_or_else(|| now.time());
    if !window_contains(time, event.start_time, event.end_time) {
        return false;
    }

    let wrapped_overnight = event.end_time < event.start_time && time < event.start_time;
    let anchor = if wrapped_overnight {
        (now - chrono::Duration::days(1)).date_naive()
    } else {
        now.date_naive()
    };

    match event.recurrence {
        Recurrence::Daily => true,
        Recurrence::Once { date } => anchor == date,
        Recurrence::Weekly { weekdays } => weekdays.contains(anchor.weekday()),
        Recurrence::Monthly { day_of_month } => anchor.day() == day_of_month,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Weekdays;
    use chrono::{NaiveDate, TimeZone, Weekday};
    use chrono_tz::UTC;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        UTC.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn event(recurrence: Recurrence, start: NaiveTime, end: NaiveTime) -> EventSchedule {
        EventSchedule {
            event_id: "e1".to_string(),
            tenant_id: "t1".to_string(),
            active: true,
            recurrence,
            start_time: start,
            end_time: end,
        }
    }

    #[test]
    fn window_boundaries_are_start_inclusive_end_exclusive() {
        assert!(!window_contains(t(8, 59), t(9, 0), t(17, 0)));
        assert!(window_contains(t(9, 0), t(9, 0), t(17, 0)));
        assert!(window_contains(t(16, 59), t(9, 0), t(17, 0)));
        assert!(!window_contains(t(17, 0), t(9, 0), t(17, 0)));
    }

    #[test]
    fn wrapped_window_covers_both_sides_of_midnight() {
        let start = t(23, 30);
        let end = t(0, 30);
        assert!(!window_contains(t(23, 29), start, end));
        assert!(window_contains(t(23, 30), start, end));
        assert!(window_contains(t(23, 59), start, end));
        assert!(window_contains(t(0, 0), start, end));
        assert!(window_contains(t(0, 29), start, end));
        assert!(!window_contains(t(0, 30), start, end));
        assert!(!window_contains(t(12, 0), start, end));
    }

    #[test]
    fn daily_event_follows_the_window_only() {
        let e = event(Recurrence::Daily, t(9, 0), t(17, 0));
        assert!(event_active_at(&e, at(2025, 6, 2, 12, 0)));
        assert!(!event_active_at(&e, at(2025, 6, 2, 18, 0)));
    }

    #[test]
    fn inactive_flag_always_wins() {
        let mut e = event(Recurrence::Daily, t(0, 0), t(23, 59));
        e.active = false;
        assert!(!event_active_at(&e, at(2025, 6, 2, 12, 0)));
    }

    #[test]
    fn once_event_runs_on_its_date_only() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let e = event(Recurrence::Once { date }, t(9, 0), t(17, 0));
        assert!(event_active_at(&e, at(2025, 6, 2, 9, 0)));
        assert!(!event_active_at(&e, at(2025, 6, 3, 9, 0)));
    }

    #[test]
    fn weekly_event_matches_the_weekday_mask() {
        let e = event(
            Recurrence::Weekly {
                weekdays: Weekdays::from_days(&[Weekday::Mon, Weekday::Wed]),
            },
            t(9, 0),
            t(17, 0),
        );
        // 2025-06-02 is a Monday.
        assert!(event_active_at(&e, at(2025, 6, 2, 10, 0)));
        assert!(!event_active_at(&e, at(2025, 6, 3, 10, 0)));
        assert!(event_active_at(&e, at(2025, 6, 4, 10, 0)));
    }

    #[test]
    fn weekly_wrapped_window_anchors_on_the_start_day() {
        // Friday 23:30 → Saturday 00:30.
        let e = event(
            Recurrence::Weekly {
                weekdays: Weekdays::from_days(&[Weekday::Fri]),
            },
            t(23, 30),
            t(0, 30),
        );
        // 2025-06-06 is a Friday.
        assert!(!event_active_at(&e, at(2025, 6, 6, 23, 29)));
        assert!(event_active_at(&e, at(2025, 6, 6, 23, 30)));
        assert!(event_active_at(&e, at(2025, 6, 6, 23, 59)));
        // Early Saturday still belongs to Friday's window.
        assert!(event_active_at(&e, at(2025, 6, 7, 0, 0)));
        assert!(event_active_at(&e, at(2025, 6, 7, 0, 29)));
        assert!(!event_active_at(&e, at(2025, 6, 7, 0, 30)));
        // A Saturday-anchored window would not qualify.
        assert!(!event_active_at(&e, at(2025, 6, 7, 23, 45)));
    }

    #[test]
    fn monthly_event_matches_the_day_of_month() {
        let e = event(Recurrence::Monthly { day_of_month: 15 }, t(9, 0), t(17, 0));
        assert!(event_active_at(&e, at(2025, 6, 15, 9, 30)));
        assert!(!event_active_at(&e, at(2025, 6, 14, 9, 30)));
        assert!(event_active_at(&e, at(2025, 7, 15, 9, 30)));
    }

    #[test]
    fn monthly_wrapped_window_spills_into_the_next_day() {
        let e = event(Recurrence::Monthly { day_of_month: 31 }, t(23, 0), t(1, 0));
        assert!(event_active_at(&e, at(2025, 5, 31, 23, 30)));
        // June 1st, 00:30 still belongs to May 31st's window.
        assert!(event_active_at(&e, at(2025, 6, 1, 0, 30)));
        assert!(!event_active_at(&e, at(2025, 6, 1, 23, 30)));
    }
}
