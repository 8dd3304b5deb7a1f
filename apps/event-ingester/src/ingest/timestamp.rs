use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc,
};
use chrono_tz::Tz;

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Resolves device timestamps to UTC instants.
///
/// Strings without an offset are wall-clock time in the configured zone. Anything
/// unparsable resolves to `None`; a bad device clock never fails the event.
#[derive(Debug, Clone, Copy)]
pub struct TimestampInterpreter {
    zone: Tz,
}

impl TimestampInterpreter {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }

    pub fn interpret(&self, raw: Option<&str>) -> Option<DateTime<Utc>> {
        let raw = raw.map(str::trim).filter(|value| !value.is_empty())?;
        if let Some(parsed) = parse_with_offset(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        let naive = parse_naive(raw)?;
        Some(self.localize(naive))
    }

    fn localize(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        if let Some(local) = self.zone.from_local_datetime(&naive).earliest() {
            return local.with_timezone(&Utc);
        }
        // Spring-forward gap: apply the offset in effect before the transition.
        let before = naive - Duration::hours(3);
        let offset = match self.zone.from_local_datetime(&before).earliest() {
            Some(local) => local.offset().fix(),
            None => self.zone.offset_from_utc_datetime(&naive).fix(),
        };
        Utc.from_utc_datetime(&(naive - offset))
    }
}

fn parse_with_offset(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed);
    }
    OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(raw, format).ok())
}

fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    if let Some(parsed) = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
    {
        return Some(parsed);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}
