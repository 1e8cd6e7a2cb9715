use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const DATE_DESIGNATORS: [char; 4] = ['Y', 'M', 'W', 'D'];
const TIME_DESIGNATORS: [char; 3] = ['H', 'M', 'S'];

/// ISO-8601 duration used as a task repeat interval, e.g. `P2Y4DT6H8M`.
///
/// Years and months are calendar units (Jan 31 + `P1M` lands on the last day
/// of February); weeks, days and the time part are exact durations. The text
/// the interval was parsed from is kept so it round-trips through storage
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatInterval {
    months: u32,
    days: u64,
    seconds: u64,
    source: String,
}

impl RepeatInterval {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Return `from` moved forward by this interval, or `None` on overflow.
    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let shifted = if self.months > 0 {
            from.checked_add_months(Months::new(self.months))?
        } else {
            from
        };
        shifted
            .checked_add_signed(Duration::try_days(i64::try_from(self.days).ok()?)?)?
            .checked_add_signed(Duration::try_seconds(i64::try_from(self.seconds).ok()?)?)
    }
}

impl FromStr for RepeatInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('P')
            .ok_or_else(|| format!("interval '{s}' must start with 'P'"))?;

        let (date_part, time_part) = match body.split_once('T') {
            Some((date, time)) => {
                if time.is_empty() {
                    return Err(format!("interval '{s}' has an empty time part"));
                }
                (date, time)
            }
            None => (body, ""),
        };

        let date = parse_components(date_part, &DATE_DESIGNATORS)?;
        let time = parse_components(time_part, &TIME_DESIGNATORS)?;
        if date.is_empty() && time.is_empty() {
            return Err(format!("interval '{s}' has no components"));
        }

        let mut months: u64 = 0;
        let mut days: u64 = 0;
        for (designator, value) in date {
            match designator {
                'Y' => months += value * 12,
                'M' => months += value,
                'W' => days += value * 7,
                _ => days += value,
            }
        }

        let mut seconds: u64 = 0;
        for (designator, value) in time {
            match designator {
                'H' => seconds += value * 3600,
                'M' => seconds += value * 60,
                _ => seconds += value,
            }
        }

        if months == 0 && days == 0 && seconds == 0 {
            return Err(format!("interval '{s}' is zero length"));
        }
        let months =
            u32::try_from(months).map_err(|_| format!("interval '{s}' is too long"))?;

        Ok(Self {
            months,
            days,
            seconds,
            source: s.to_string(),
        })
    }
}

/// Split `part` into `(designator, value)` pairs, enforcing designator order.
fn parse_components(part: &str, designators: &[char]) -> Result<Vec<(char, u64)>, String> {
    let mut components = Vec::new();
    let mut digits = String::new();
    let mut allowed_from = 0;

    for c in part.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let offset = designators[allowed_from..]
            .iter()
            .position(|d| *d == c)
            .ok_or_else(|| format!("unexpected '{c}' in interval"))?;
        if digits.is_empty() {
            return Err(format!("missing value before '{c}'"));
        }
        let value: u32 = digits
            .parse()
            .map_err(|_| format!("value before '{c}' is too large"))?;
        components.push((c, u64::from(value)));
        digits.clear();
        allowed_from += offset + 1;
    }

    if !digits.is_empty() {
        return Err(format!("trailing value '{digits}' has no designator"));
    }
    Ok(components)
}

impl fmt::Display for RepeatInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for RepeatInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for RepeatInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
