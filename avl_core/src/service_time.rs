//! Service-day clock: converts between epoch milliseconds and the
//! "seconds into day" values schedules are expressed in.

use serde::{Deserialize, Serialize};

pub const MS_PER_SEC: i64 = 1000;
pub const SEC_PER_DAY: i64 = 24 * 60 * 60;
pub const MS_PER_DAY: i64 = SEC_PER_DAY * MS_PER_SEC;
const MS_PER_HALF_DAY: i64 = MS_PER_DAY / 2;

/// Agency-local clock with a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceClock {
    pub utc_offset_secs: i32,
}

impl ServiceClock {
    pub fn new(utc_offset_secs: i32) -> Self {
        Self { utc_offset_secs }
    }

    fn local_ms(&self, epoch_ms: i64) -> i64 {
        epoch_ms + self.utc_offset_secs as i64 * MS_PER_SEC
    }

    /// Local seconds since midnight, in [0, 86400).
    pub fn seconds_into_day(&self, epoch_ms: i64) -> i32 {
        (self.msecs_into_day(epoch_ms) / MS_PER_SEC) as i32
    }

    /// Local milliseconds since midnight.
    pub fn msecs_into_day(&self, epoch_ms: i64) -> i64 {
        self.local_ms(epoch_ms).rem_euclid(MS_PER_DAY)
    }

    /// Epoch ms of the local midnight starting the day containing `epoch_ms`.
    pub fn start_of_day(&self, epoch_ms: i64) -> i64 {
        epoch_ms - self.msecs_into_day(epoch_ms)
    }

    /// Local day number (days since 1970-01-01 local).
    pub fn day_number(&self, epoch_ms: i64) -> i64 {
        self.local_ms(epoch_ms).div_euclid(MS_PER_DAY)
    }

    /// Converts a schedule time to an epoch time on the day closest to
    /// `reference_ms`, so a 25:30 schedule time or a report just after
    /// midnight resolve to the right calendar day.
    pub fn epoch_time(&self, secs_into_day: i32, reference_ms: i64) -> i64 {
        let mut epoch = self.start_of_day(reference_ms) + secs_into_day as i64 * MS_PER_SEC;
        if epoch > reference_ms + MS_PER_HALF_DAY {
            epoch -= MS_PER_DAY;
        } else if epoch < reference_ms - MS_PER_HALF_DAY {
            epoch += MS_PER_DAY;
        }
        epoch
    }
}

/// Day number for a GTFS-style `YYYYMMDD` date.
pub fn day_from_date_key(date: u32) -> i64 {
    let y = (date / 10_000) as i64;
    let m = ((date / 100) % 100) as i64;
    let d = (date % 100) as i64;
    days_from_civil(y, m, d)
}

/// `YYYYMMDD` for a day number.
pub fn date_key_from_day(day: i64) -> u32 {
    let (y, m, d) = civil_from_days(day);
    (y * 10_000 + m * 100 + d) as u32
}

/// 0 = Monday ... 6 = Sunday.
pub fn weekday(day: i64) -> usize {
    // 1970-01-01 was a Thursday
    (day + 3).rem_euclid(7) as usize
}

// Howard Hinnant's civil calendar conversions.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + if m <= 2 { 1 } else { 0 };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // 2024-01-01 00:00:00 UTC
    const JAN_1_2024: i64 = 1_704_067_200_000;

    #[test]
    fn test_seconds_into_day_with_offset() {
        let utc = ServiceClock::new(0);
        assert_eq!(utc.seconds_into_day(JAN_1_2024 + 3_600_000), 3600);

        // UTC-8: midnight UTC is 16:00 the previous local day
        let pacific = ServiceClock::new(-8 * 3600);
        assert_eq!(pacific.seconds_into_day(JAN_1_2024), 16 * 3600);
        assert_eq!(pacific.day_number(JAN_1_2024), day_from_date_key(20231231));
    }

    #[test]
    fn test_epoch_time_picks_closest_day() {
        let clock = ServiceClock::new(0);
        // Reference just after midnight, schedule time late the previous evening
        let reference = JAN_1_2024 + 10 * 60 * 1000;
        let t = clock.epoch_time(23 * 3600 + 50 * 60, reference);
        assert_eq!(t, JAN_1_2024 - 10 * 60 * 1000);

        // Schedule time past 24h belongs to the service day that started yesterday
        let reference = JAN_1_2024 + 30 * 60 * 1000;
        let t = clock.epoch_time(24 * 3600 + 20 * 60, reference);
        assert_eq!(t, JAN_1_2024 + 20 * 60 * 1000);
    }

    #[test]
    fn test_date_keys() {
        assert_eq!(day_from_date_key(19700101), 0);
        assert_eq!(day_from_date_key(20240101), JAN_1_2024 / MS_PER_DAY);
        assert_eq!(date_key_from_day(day_from_date_key(20240229)), 20240229);
        // 2024-01-01 was a Monday
        assert_eq!(weekday(day_from_date_key(20240101)), 0);
        assert_eq!(weekday(day_from_date_key(20240107)), 6);
    }

    proptest! {
        #[test]
        fn prop_date_key_roundtrip(day in -100_000i64..100_000) {
            prop_assert_eq!(day_from_date_key(date_key_from_day(day)), day);
        }

        #[test]
        fn prop_epoch_time_within_half_day(secs in 0i32..(30 * 3600), offset in 0i64..MS_PER_DAY) {
            let clock = ServiceClock::new(0);
            let reference = JAN_1_2024 + offset;
            let t = clock.epoch_time(secs, reference);
            prop_assert!((t - reference).abs() <= MS_PER_HALF_DAY);
        }
    }
}
