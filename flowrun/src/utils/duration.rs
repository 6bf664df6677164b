//! Parsing of human-written durations such as `"2h30m"` or `"45min"`.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::errors::TimeParseError;

const COMPONENT: &str = r"(\d+h)(our)?|(\d+m)(in)?|(\d+s)(econd)?";

static COMPONENTS: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(COMPONENT));
static WHOLE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(&format!("^({COMPONENT})+$")));

/// Parses a duration made of hour, minute and second components.
///
/// Each component is a number followed by `h`/`hour`, `m`/`min` or
/// `s`/`second`; components are summed. Matching is case-insensitive.
///
/// # Errors
///
/// Returns [`TimeParseError`] when the string is empty or contains anything
/// besides duration components.
///
/// # Examples
///
/// ```
/// use flowrun::utils::parse_time;
/// use std::time::Duration;
///
/// assert_eq!(parse_time("1h30m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_time("45min").unwrap(), Duration::from_secs(2700));
/// assert!(parse_time("soon").is_err());
/// ```
pub fn parse_time(input: &str) -> Result<Duration, TimeParseError> {
    let invalid = || TimeParseError {
        input: input.to_string(),
    };
    let (Ok(whole), Ok(components)) = (WHOLE.as_ref(), COMPONENTS.as_ref()) else {
        return Err(invalid());
    };

    let lower = input.to_lowercase();
    if !whole.is_match(&lower) {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    for caps in components.captures_iter(&lower) {
        let part = [1, 3, 5]
            .iter()
            .find_map(|i| caps.get(*i))
            .map(|m| m.as_str())
            .ok_or_else(invalid)?;
        let (digits, unit) = part.split_at(part.len() - 1);
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        let secs = match unit {
            "h" => n.checked_mul(3600),
            "m" => n.checked_mul(60),
            _ => Some(n),
        }
        .ok_or_else(invalid)?;
        total = total.checked_add(Duration::from_secs(secs)).ok_or_else(invalid)?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_combined() {
        assert_eq!(parse_time("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_time("2h30m10s").unwrap(), Duration::from_secs(9010));
        assert_eq!(parse_time("1h30m30s").unwrap(), Duration::from_secs(5430));
    }

    #[test]
    fn test_parse_rejects_separators() {
        assert!(parse_time("1h:30m").is_err());
        assert!(parse_time("1h 30m").is_err());
    }

    #[test]
    fn test_parse_long_units() {
        assert_eq!(parse_time("30min").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_time("1hour").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_time("15second").unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(parse_time("1H5M").unwrap(), Duration::from_secs(3900));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "abc", "10", "1d", "1h-", " 1h", "h"] {
            assert!(parse_time(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
