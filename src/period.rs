use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};

/// How often a quota window resets. All boundaries are UTC-anchored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodGranularity {
    /// The UTC calendar day.
    Daily,
    /// The UTC calendar month.
    #[default]
    Monthly,
}

/// One bounded quota window: `start` inclusive, `end` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaPeriod {
    pub start: Date,
    pub end: Date,
}

impl QuotaPeriod {
    /// Derives the period containing `now` for the given granularity.
    ///
    /// Pure; the fallbacks below are only reachable at the edge of the
    /// representable date range.
    pub fn current(now: OffsetDateTime, granularity: PeriodGranularity) -> Self {
        let today = now.date();
        match granularity {
            PeriodGranularity::Daily => Self {
                start: today,
                end: today.next_day().unwrap_or(today),
            },
            PeriodGranularity::Monthly => {
                let start = today.replace_day(1).unwrap_or(today);
                let end = match start.month() {
                    Month::December => {
                        Date::from_calendar_date(start.year() + 1, Month::January, 1)
                    }
                    month => Date::from_calendar_date(start.year(), month.next(), 1),
                }
                .unwrap_or(start);
                Self { start, end }
            }
        }
    }

    pub fn contains(&self, date: Date) -> bool {
        date >= self.start && date < self.end
    }
}

const PERIOD_START_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// `YYYY-MM-DD`, the form stored in backends and shown to dashboards.
pub(crate) fn format_period_start(date: Date) -> String {
    date.format(&PERIOD_START_FORMAT).unwrap_or_default()
}

#[cfg(any(feature = "store-sqlite", feature = "store-redis"))]
pub(crate) fn parse_period_start(raw: &str) -> Option<Date> {
    Date::parse(raw, &PERIOD_START_FORMAT).ok()
}
