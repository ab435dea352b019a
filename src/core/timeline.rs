//! Calendar buckets.
//!
//! A `TimeId` is a deterministic bucket identifier; ids nest hour -> day ->
//! ISO week -> month -> quarter -> year -> decade (weeks attach to the month
//! containing their Thursday, which is also how ISO assigns the week-year).
//!
//! Formats: `h2024-07-05T13`, `d2024-07-05`, `w2024-W27`, `m2024-07`,
//! `q2024-Q3`, `y2024`, `e2020`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, Weekday};

use super::error::CoreError;
use super::identity::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeScale {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Decade,
}

impl TimeScale {
    fn prefix(self) -> char {
        match self {
            TimeScale::Hour => 'h',
            TimeScale::Day => 'd',
            TimeScale::Week => 'w',
            TimeScale::Month => 'm',
            TimeScale::Quarter => 'q',
            TimeScale::Year => 'y',
            TimeScale::Decade => 'e',
        }
    }
}

/// Validated calendar bucket id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeId(String);

impl TimeId {
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let bad = |reason: &str| CoreError::InvalidId {
            raw: s.clone(),
            reason: format!("time id: {reason}"),
        };
        if Self::decompose(&s).is_none() {
            return Err(bad("unrecognized format"));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scale(&self) -> TimeScale {
        Self::decompose(&self.0).expect("validated on construction").0
    }

    /// The bucket containing `ms` (UTC) at the given scale.
    pub fn at(scale: TimeScale, ms: u64) -> Self {
        let dt = OffsetDateTime::from_unix_timestamp((ms / 1_000) as i64)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let date = dt.date();
        let s = match scale {
            TimeScale::Hour => format!(
                "h{:04}-{:02}-{:02}T{:02}",
                date.year(),
                u8::from(date.month()),
                date.day(),
                dt.hour()
            ),
            TimeScale::Day => Self::fmt_day(date),
            TimeScale::Week => Self::fmt_week(date),
            TimeScale::Month => Self::fmt_month(date.year(), u8::from(date.month())),
            TimeScale::Quarter => Self::fmt_quarter(date.year(), u8::from(date.month())),
            TimeScale::Year => format!("y{:04}", date.year()),
            TimeScale::Decade => format!("e{:04}", date.year() / 10 * 10),
        };
        Self(s)
    }

    /// The id of the enclosing bucket one scale up; `None` for decades.
    pub fn parent(&self) -> Option<TimeId> {
        let (scale, date) = Self::decompose(&self.0)?;
        let id = match scale {
            TimeScale::Hour => Self::fmt_day(date?),
            TimeScale::Day => Self::fmt_week(date?),
            TimeScale::Week => {
                let date = date?;
                Self::fmt_month(date.year(), u8::from(date.month()))
            }
            TimeScale::Month => {
                let date = date?;
                Self::fmt_quarter(date.year(), u8::from(date.month()))
            }
            TimeScale::Quarter => {
                let year: i32 = self.0[1..5].parse().ok()?;
                format!("y{year:04}")
            }
            TimeScale::Year => {
                let year: i32 = self.0[1..5].parse().ok()?;
                format!("e{:04}", year.div_euclid(10) * 10)
            }
            TimeScale::Decade => return None,
        };
        Some(Self(id))
    }

    fn fmt_day(date: Date) -> String {
        format!(
            "d{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        )
    }

    fn fmt_week(date: Date) -> String {
        let (year, week, _) = date.to_iso_week_date();
        format!("w{year:04}-W{week:02}")
    }

    fn fmt_month(year: i32, month: u8) -> String {
        format!("m{year:04}-{month:02}")
    }

    fn fmt_quarter(year: i32, month: u8) -> String {
        format!("q{year:04}-Q{}", (month - 1) / 3 + 1)
    }

    /// Scale plus a representative date: the day itself, a week's Thursday,
    /// a month's first day. Scales at year and above carry no date.
    fn decompose(s: &str) -> Option<(TimeScale, Option<Date>)> {
        let mut chars = s.chars();
        let prefix = chars.next()?;
        let rest = chars.as_str();
        let date_of = |y: &str, m: &str, d: &str| -> Option<Date> {
            Date::from_calendar_date(
                y.parse().ok()?,
                Month::try_from(m.parse::<u8>().ok()?).ok()?,
                d.parse().ok()?,
            )
            .ok()
        };
        match prefix {
            'h' => {
                // 2024-07-05T13
                let (day, hour) = rest.split_once('T')?;
                if hour.len() != 2 || hour.parse::<u8>().ok()? > 23 {
                    return None;
                }
                let mut parts = day.splitn(3, '-');
                let date = date_of(parts.next()?, parts.next()?, parts.next()?)?;
                Some((TimeScale::Hour, Some(date)))
            }
            'd' => {
                let mut parts = rest.splitn(3, '-');
                let date = date_of(parts.next()?, parts.next()?, parts.next()?)?;
                Some((TimeScale::Day, Some(date)))
            }
            'w' => {
                // 2024-W27 -> the week's Thursday
                let (year, week) = rest.split_once("-W")?;
                let date = Date::from_iso_week_date(
                    year.parse().ok()?,
                    week.parse().ok()?,
                    Weekday::Thursday,
                )
                .ok()?;
                Some((TimeScale::Week, Some(date)))
            }
            'm' => {
                let (year, month) = rest.split_once('-')?;
                let date = date_of(year, month, "1")?;
                Some((TimeScale::Month, Some(date)))
            }
            'q' => {
                let (year, quarter) = rest.split_once("-Q")?;
                let q: u8 = quarter.parse().ok()?;
                if !(1..=4).contains(&q) {
                    return None;
                }
                let date = date_of(year, &((q - 1) * 3 + 1).to_string(), "1")?;
                Some((TimeScale::Quarter, Some(date)))
            }
            'y' => {
                rest.parse::<i32>().ok()?;
                if rest.len() != 4 {
                    return None;
                }
                Some((TimeScale::Year, None))
            }
            'e' => {
                let year: i32 = rest.parse().ok()?;
                if rest.len() != 4 || year % 10 != 0 {
                    return None;
                }
                Some((TimeScale::Decade, None))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for TimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeId({:?})", self.0)
    }
}

impl fmt::Display for TimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TimeId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        TimeId::parse(s)
    }
}

impl From<TimeId> for String {
    fn from(id: TimeId) -> String {
        id.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowChildren {
    #[default]
    None,
    Partial,
    Full,
}

impl ShowChildren {
    /// none -> full -> partial -> none
    pub fn cycled(self) -> Self {
        match self {
            ShowChildren::None => ShowChildren::Full,
            ShowChildren::Full => ShowChildren::Partial,
            ShowChildren::Partial => ShowChildren::None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeNode {
    pub created_at: u64,
    pub nodes: BTreeMap<NodeId, f64>,
    pub show_children: ShowChildren,
    pub text: String,
    /// Minutes east of UTC at assignment time, kept so a renderer can
    /// reconstruct the local bucket boundary.
    #[serde(default)]
    pub tz_minutes: i32,
}

impl TimeNode {
    pub fn new(now_ms: u64) -> Self {
        Self {
            created_at: now_ms,
            nodes: BTreeMap::new(),
            show_children: ShowChildren::None,
            text: String::new(),
            tz_minutes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_ids_are_deterministic() {
        // 2024-07-05T13:30:00Z
        let ms = 1_720_186_200_000;
        assert_eq!(TimeId::at(TimeScale::Hour, ms).as_str(), "h2024-07-05T13");
        assert_eq!(TimeId::at(TimeScale::Day, ms).as_str(), "d2024-07-05");
        assert_eq!(TimeId::at(TimeScale::Week, ms).as_str(), "w2024-W27");
        assert_eq!(TimeId::at(TimeScale::Month, ms).as_str(), "m2024-07");
        assert_eq!(TimeId::at(TimeScale::Quarter, ms).as_str(), "q2024-Q3");
        assert_eq!(TimeId::at(TimeScale::Year, ms).as_str(), "y2024");
        assert_eq!(TimeId::at(TimeScale::Decade, ms).as_str(), "e2020");
    }

    #[test]
    fn parents_nest_upward() {
        let hour = TimeId::parse("h2024-07-05T13").unwrap();
        let day = hour.parent().unwrap();
        assert_eq!(day.as_str(), "d2024-07-05");
        let week = day.parent().unwrap();
        assert_eq!(week.as_str(), "w2024-W27");
        let month = week.parent().unwrap();
        assert_eq!(month.as_str(), "m2024-07");
        let quarter = month.parent().unwrap();
        assert_eq!(quarter.as_str(), "q2024-Q3");
        let year = quarter.parent().unwrap();
        assert_eq!(year.as_str(), "y2024");
        let decade = year.parent().unwrap();
        assert_eq!(decade.as_str(), "e2020");
        assert_eq!(decade.parent(), None);
    }

    #[test]
    fn iso_week_crossing_year_boundary() {
        // 2024-12-30 is W01 of ISO year 2025.
        let ms = 1_735_556_400_000;
        let week = TimeId::at(TimeScale::Week, ms);
        assert_eq!(week.as_str(), "w2025-W01");
        // That week's Thursday is 2025-01-02, so the week rolls up to
        // January 2025.
        assert_eq!(week.parent().unwrap().as_str(), "m2025-01");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(TimeId::parse("z2024").is_err());
        assert!(TimeId::parse("q2024-Q5").is_err());
        assert!(TimeId::parse("d2024-13-01").is_err());
        assert!(TimeId::parse("e2021").is_err());
        assert!(TimeId::parse("h2024-07-05T24").is_err());
    }
}
