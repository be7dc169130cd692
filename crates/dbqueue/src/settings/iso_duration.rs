//! ISO-8601 durations as used in queue settings (`PT3M`, `P1DT2H`, `PT0.5S`)
//!
//! Only the day and time designators are understood. Calendar units (years,
//! months, weeks) have no fixed length and negative durations make no sense as
//! delays, so both are rejected.

use std::time::Duration;

/// Returned when a setting does not hold an ISO-8601 duration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ISO-8601 duration: {0:?}")]
pub struct InvalidIsoDuration(pub String);

/// Parse `PnDTnHnMn.nS` (every component optional, at least one required)
pub fn parse_iso_duration(text: &str) -> Result<Duration, InvalidIsoDuration> {
    let invalid = || InvalidIsoDuration(text.to_string());

    let upper = text.trim().to_ascii_uppercase();
    let rest = upper.strip_prefix('P').ok_or_else(invalid)?;

    let (date_part, time_part) = match rest.split_once('T') {
        Some((_, "")) => return Err(invalid()),
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };
    if date_part.is_empty() && time_part.is_none() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    if !date_part.is_empty() {
        let days = date_part.strip_suffix('D').ok_or_else(invalid)?;
        let days = parse_integer(days).ok_or_else(invalid)?;
        let secs = days.checked_mul(86_400).ok_or_else(invalid)?;
        total = Duration::from_secs(secs);
    }
    if let Some(time) = time_part {
        let time = parse_time_part(time).ok_or_else(invalid)?;
        total = total.checked_add(time).ok_or_else(invalid)?;
    }

    Ok(total)
}

/// Render a duration the way `parse_iso_duration` reads it back
pub fn format_iso_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let nanos = duration.subsec_nanos();
    if secs == 0 && nanos == 0 {
        return "PT0S".to_string();
    }

    let mut out = String::from("PT");
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if nanos > 0 {
        let fraction = format!("{nanos:09}");
        out.push_str(&format!("{seconds}.{}S", fraction.trim_end_matches('0')));
    } else if seconds > 0 {
        out.push_str(&format!("{seconds}S"));
    }
    out
}

fn parse_time_part(mut time: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut last_rank = 0;

    while !time.is_empty() {
        let end = time.find(|c: char| c.is_ascii_alphabetic())?;
        let number = &time[..end];
        let unit = time[end..].chars().next()?;
        time = &time[end + unit.len_utf8()..];

        let (rank, unit_secs) = match unit {
            'H' => (1, 3600),
            'M' => (2, 60),
            'S' => (3, 1),
            _ => return None,
        };
        // Units must appear at most once and in H, M, S order
        if rank <= last_rank {
            return None;
        }
        last_rank = rank;

        let part = if unit == 'S' {
            parse_seconds(number)?
        } else {
            Duration::from_secs(parse_integer(number)?.checked_mul(unit_secs)?)
        };
        total = total.checked_add(part)?;
    }

    Some(total)
}

fn parse_seconds(number: &str) -> Option<Duration> {
    let (whole, fraction) = match number.split_once(['.', ',']) {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (number, None),
    };
    let secs = parse_integer(whole)?;

    let nanos = match fraction {
        None => 0,
        Some(fraction) => {
            if fraction.is_empty()
                || fraction.len() > 9
                || !fraction.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            format!("{fraction:0<9}").parse::<u32>().ok()?
        }
    };

    Some(Duration::new(secs, nanos))
}

fn parse_integer(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
