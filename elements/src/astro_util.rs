//! Spherical astronomy helpers shared by the scheduler (slew-accuracy
//! checks, wait-for-start timing) and the plate solver adapter.

use astro::angle::anglr_sepr;
use astro::coords::{alt_frm_eq, az_frm_eq, hr_angl_frm_hz};
use astro::time::{julian_day, mn_sidr, CalType, Date};

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;
use std::time::SystemTime;

/// Angular separation (radians) between two equatorial coordinate pairs,
/// also given in radians.
pub fn angular_separation(p0_ra: f64, p0_dec: f64, p1_ra: f64, p1_dec: f64) -> f64 {
    anglr_sepr(p0_ra, p0_dec, p1_ra, p1_dec)
}

/// Euclidean approximation of angular error used by the scheduler's
/// slew-accuracy check (spec §4.7): `sqrt((ra-ra')^2 + (dec-dec')^2)`, all
/// in degrees. This is deliberately the crude metric spec.md names, not the
/// great-circle `angular_separation` above (that one is exposed for callers
/// who want the correct spherical distance).
pub fn naive_angular_error_deg(ra_a: f64, dec_a: f64, ra_b: f64, dec_b: f64) -> f64 {
    ((ra_a - ra_b).powi(2) + (dec_a - dec_b).powi(2)).sqrt()
}

/// Returns (alt, az, hour_angle) in radians for the given equatorial
/// coordinates, observer location and time. Azimuth is clockwise from
/// north; hour angle is on -PI..PI.
pub fn alt_az_from_equatorial(
    ra: f64,
    dec: f64,
    lat: f64,
    long: f64,
    time: SystemTime,
) -> (f64, f64, f64) {
    let gmst = greenwich_mean_sidereal_time(time);
    let hour_angle = gmst + long - ra;

    let meeus_az = az_frm_eq(hour_angle, dec, lat);
    let az = limit_to_two_pi(meeus_az + PI);
    let mut ha = limit_to_two_pi(hour_angle);
    if ha > PI {
        ha -= 2.0 * PI;
    }
    (alt_frm_eq(hour_angle, dec, lat), az, ha)
}

/// Inverse of [`alt_az_from_equatorial`].
pub fn equatorial_from_alt_az(
    alt: f64,
    az: f64,
    lat: f64,
    long: f64,
    time: SystemTime,
) -> (f64, f64) {
    let meeus_az = limit_to_two_pi(az - PI);
    let gmst = greenwich_mean_sidereal_time(time);

    let dec = (lat.sin() * alt.sin() - lat.cos() * alt.cos() * meeus_az.cos()).asin();
    let hour_angle = hr_angl_frm_hz(meeus_az, alt, lat);
    let ra = gmst + long - hour_angle;
    (ra, dec)
}

fn greenwich_mean_sidereal_time(time: SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(time);
    let date = Date {
        year: dt_utc.date_naive().year() as i16,
        month: dt_utc.date_naive().month() as u8,
        decimal_day: dt_utc.date_naive().day() as f64,
        cal_type: CalType::Gregorian,
    };
    let jd = julian_day(&date);

    let utc_hours = dt_utc.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;
    limit_to_two_pi((gmst_hours * 15.0).to_radians())
}

fn limit_to_two_pi(mut x: f64) -> f64 {
    let two_pi = 2.0 * PI;
    x %= two_pi;
    if x < 0.0 {
        x += two_pi;
    }
    x
}

/// Given the observation's `start` field (a UTC hour-of-day, possibly
/// `>= 24` to mean "the following day" per spec.md §3), and the previous
/// item's resolved absolute start time, returns the absolute UTC time this
/// item should begin. Matches spec.md §4.7's `waitForStart`: today's UTC
/// date at `hour = start`, bumped a day if that would not be strictly after
/// `after`.
pub fn resolve_start_time(start_hour: f64, now: DateTime<Utc>, after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let base_date = now.date_naive();
    let mut candidate = base_date.and_hms_opt(0, 0, 0).unwrap().and_utc()
        + chrono::Duration::milliseconds((start_hour * 3_600_000.0).round() as i64);
    if let Some(after) = after {
        while candidate <= after {
            candidate += chrono::Duration::days(1);
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use astro::angle::{deg_frm_dms, deg_frm_hms};
    use chrono::{FixedOffset, TimeZone};
    use std::time::Duration;

    #[test]
    fn test_angular_separation() {
        let p0_ra = PI;
        let p0_dec = 0.0;
        let p1_ra = PI + 1.0;
        let p1_dec = 1.0;
        assert_abs_diff_eq!(
            angular_separation(p0_ra, p0_dec, p1_ra, p1_dec),
            1.27,
            epsilon = 0.01
        );
    }

    #[test]
    fn test_naive_angular_error() {
        assert_abs_diff_eq!(naive_angular_error_deg(10.0, 40.0, 10.0, 40.0), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(naive_angular_error_deg(10.0, 40.0, 13.0, 44.0), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_alt_az_equatorial_conversion() {
        let mizar_ra = deg_frm_hms(13, 23, 55.5).to_radians();
        let mizar_dec = deg_frm_dms(54, 55, 31.3).to_radians();
        let dt = FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 7, 23, 56, 0)
            .unwrap();
        let time = SystemTime::UNIX_EPOCH
            .checked_add(Duration::from_secs_f64(dt.timestamp_millis() as f64 / 1000.0))
            .unwrap();
        let lat = 37_f64.to_radians();
        let long = -122_f64.to_radians();

        let (alt, az, _ha) = alt_az_from_equatorial(mizar_ra, mizar_dec, lat, long, time);
        assert_abs_diff_eq!(alt, deg_frm_dms(58, 52, 14.3).to_radians(), epsilon = 0.01);
        assert_abs_diff_eq!(az, deg_frm_dms(42, 59, 36.7).to_radians(), epsilon = 0.01);

        let (ra, dec) = equatorial_from_alt_az(alt, az, lat, long, time);
        assert_abs_diff_eq!(ra, mizar_ra, epsilon = 0.01);
        assert_abs_diff_eq!(dec, mizar_dec, epsilon = 0.01);
    }

    #[test]
    fn test_resolve_start_time_wraps_past_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 7, 31, 20, 0, 0).unwrap();
        // start=1.0 (1am) is earlier in the day than `now`, but there is no
        // `after` constraint, so it resolves to today at 01:00.
        let t = resolve_start_time(1.0, now, None);
        assert_eq!(t.hour(), 1);

        // With an `after` constraint later than the naive candidate, the
        // candidate must roll forward a day.
        let after = Utc.with_ymd_and_hms(2026, 7, 31, 22, 0, 0).unwrap();
        let t2 = resolve_start_time(1.0, now, Some(after));
        assert_eq!(t2.day(), 1);
        assert_eq!(t2.month(), 8);
    }
}
