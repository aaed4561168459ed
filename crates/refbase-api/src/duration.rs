// SPDX-License-Identifier: MIT OR Apache-2.0
//! ISO-8601 duration parsing for lease query parameters.

use refbase_error::{RepoError, RepoResult};
use std::time::Duration;

/// Parse an ISO-8601 duration of the form `P[nD][T[nH][nM][nS]]`.
///
/// Fractional components are not accepted; leases are whole seconds.
pub fn parse_iso8601_duration(raw: &str) -> RepoResult<Duration> {
    let invalid = || RepoError::invalid_payload(format!("invalid ISO-8601 duration {raw:?}"));

    let rest = raw.strip_prefix('P').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return Err(invalid()),
        None => (rest, None),
    };

    let mut seconds: u64 = 0;
    let mut parse_units = |part: &str, units: &[(char, u64)]| -> RepoResult<()> {
        let mut number = String::new();
        let mut last_unit_index: Option<usize> = None;
        for ch in part.chars() {
            if ch.is_ascii_digit() {
                number.push(ch);
                continue;
            }
            let index = units
                .iter()
                .position(|(unit, _)| *unit == ch)
                .ok_or_else(invalid)?;
            // Units must appear in order, each at most once.
            if last_unit_index.is_some_and(|last| index <= last) || number.is_empty() {
                return Err(invalid());
            }
            last_unit_index = Some(index);
            let value: u64 = number.parse().map_err(|_| invalid())?;
            seconds = seconds.saturating_add(value.saturating_mul(units[index].1));
            number.clear();
        }
        if !number.is_empty() {
            return Err(invalid());
        }
        Ok(())
    };

    parse_units(date_part, &[('D', 86_400)])?;
    if let Some(time_part) = time_part {
        parse_units(time_part, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    }
    Ok(Duration::from_secs(seconds))
}
