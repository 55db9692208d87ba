//! Timestamp detection in free-form log lines.
//!
//! The detector holds an ordered list of [`DateTemplate`]s and returns the
//! first one that both matches and converts. Templates that succeed gain a
//! hit; the filter periodically calls [`DateDetector::sort_by_hits`] so that
//! the format a log actually uses moves to the front.
//!
//! Month names are matched against a fixed table (English abbreviations plus
//! German, French and Polish aliases) instead of the host locale, so results
//! do not depend on the environment the daemon runs in.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, Local, NaiveDate,
    NaiveDateTime, NaiveTime, TimeZone,
};
use parking_lot::RwLock;
use regex::{Captures, Regex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

use crate::clock::SharedClock;
use crate::error::{WardenError, WardenResult};

/// How a template turns its match into a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// Named groups `Y`/`y`, `m`/`b`, `d`, `H`, `M`, `S` and optional `z`.
    Fields,
    /// Seconds since the epoch in group `e`.
    Epoch,
    /// TAI64N label in group `x`.
    Tai64n,
}

#[derive(Debug)]
pub struct DateTemplate {
    name: String,
    regex: Regex,
    kind: TemplateKind,
    hits: AtomicU64,
    /// The `%`-pattern a user template was built from.
    source: Option<String>,
}

impl DateTemplate {
    pub fn new(name: &str, pattern: &str, kind: TemplateKind) -> WardenResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| WardenError::Config(format!("bad date template '{}': {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            regex,
            kind,
            hits: AtomicU64::new(0),
            source: None,
        })
    }

    /// Build a template from a `%`-field pattern such as
    /// `%Y-%m-%d %H:%M:%S`. Text outside the fields is a regex; a leading
    /// `^` anchors the template at the start of the line.
    pub fn from_pattern(pattern: &str) -> WardenResult<Self> {
        let (anchored, body) = match pattern.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let mut regex = String::from(if anchored { "^" } else { "" });
        let mut name = String::new();
        let mut kind = TemplateKind::Fields;
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                regex.push(c);
                name.push(c);
                continue;
            }
            let field = chars.next().ok_or_else(|| {
                WardenError::Config(format!("date pattern '{}' ends with '%'", pattern))
            })?;
            let (part, label) = match field {
                'Y' => (r"(?P<Y>\d{4})", "Year"),
                'y' => (r"(?P<y>\d{2})", "Year2"),
                'm' => (r"(?P<m>\d{1,2})", "Month"),
                'd' => (r"(?P<d>\d{1,2})", "Day"),
                'b' => (r"(?P<b>\w{3})", "MON"),
                'B' => (r"(?P<b>\w{3})\w*", "MONTH"),
                'a' => (r"\w{3}", "DAY"),
                'A' => (r"\w+", "DAYNAME"),
                'H' => (r"(?P<H>\d{2})", "24hour"),
                'M' => (r"(?P<M>\d{2})", "Minute"),
                'S' => (r"(?P<S>\d{2})", "Second"),
                'f' => (r"\d+", "Microseconds"),
                'z' => (r"(?P<z>Z|[-+]\d{2}:?\d{2})", "Zone offset"),
                's' => {
                    kind = TemplateKind::Epoch;
                    (r"(?P<e>\d{10})", "Epoch")
                }
                '%' => ("%", "%"),
                other => {
                    return Err(WardenError::Config(format!(
                        "unsupported field '%{}' in date pattern '{}'",
                        other, pattern
                    )))
                }
            };
            regex.push_str(part);
            name.push_str(label);
        }
        let mut template = Self::new(&name, &regex, kind)?;
        template.source = Some(pattern.to_string());
        Ok(template)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Position of the detected date within a line and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateMatch {
    pub start: usize,
    pub end: usize,
    /// `None` when the text matched a template but is not a real date.
    pub time: Option<i64>,
}

/// Zone in which dates without an explicit offset are interpreted.
#[derive(Debug, Clone, Copy)]
pub enum Zone {
    Local,
    Fixed(FixedOffset),
}

impl Zone {
    fn to_timestamp(self, naive: &NaiveDateTime) -> Option<i64> {
        match self {
            Zone::Local => Local
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.timestamp()),
            Zone::Fixed(off) => off
                .from_local_datetime(naive)
                .single()
                .map(|dt| dt.timestamp()),
        }
    }

    fn naive_at(self, ts: i64) -> Option<NaiveDateTime> {
        match self {
            Zone::Local => Local
                .timestamp_opt(ts, 0)
                .single()
                .map(|dt| dt.naive_local()),
            Zone::Fixed(off) => off
                .timestamp_opt(ts, 0)
                .single()
                .map(|dt| dt.naive_local()),
        }
    }
}

const ENGLISH_MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Non-English three letter month abbreviations (de, fr, pl).
const MONTH_ALIASES: &[(&str, u32)] = &[
    ("sty", 1),
    ("fév", 2),
    ("fev", 2),
    ("lut", 2),
    ("mär", 3),
    ("mrz", 3),
    ("avr", 4),
    ("kwi", 4),
    ("mai", 5),
    ("maj", 5),
    ("cze", 6),
    ("lip", 7),
    ("aoû", 8),
    ("aou", 8),
    ("sie", 8),
    ("wrz", 9),
    ("okt", 10),
    ("paź", 10),
    ("paz", 10),
    ("lis", 11),
    ("déc", 12),
    ("dez", 12),
    ("gru", 12),
];

/// Month number for an abbreviated month name, English first.
pub fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    if let Some(i) = ENGLISH_MONTHS.iter().position(|m| *m == lower) {
        return Some(i as u32 + 1);
    }
    let month = MONTH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, m)| *m);
    if let Some(m) = month {
        debug!("Replacing month alias {:?} with {}", name, ENGLISH_MONTHS[m as usize - 1]);
    }
    month
}

/// Default templates in their initial order.
const DEFAULT_TEMPLATES: &[(&str, &str, TemplateKind)] = &[
    (
        "MONTH Day Hour:Minute:Second",
        r"(?P<b>\S{3})\s{1,2}(?P<d>\d{1,2}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "WEEKDAY MONTH Day Hour:Minute:Second Year",
        r"\S{3} (?P<b>\S{3})\s{1,2}(?P<d>\d{1,2}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2}) (?P<Y>\d{4})",
        TemplateKind::Fields,
    ),
    (
        "WEEKDAY MONTH Day Hour:Minute:Second",
        r"\S{3} (?P<b>\S{3})\s{1,2}(?P<d>\d{1,2}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Year/Month/Day Hour:Minute:Second",
        r"(?P<Y>\d{4})/(?P<m>\d{2})/(?P<d>\d{2}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Day/Month/Year Hour:Minute:Second",
        r"(?P<d>\d{2})/(?P<m>\d{2})/(?P<Y>\d{4}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Day/Month/Year2 Hour:Minute:Second",
        r"(?P<d>\d{2})/(?P<m>\d{2})/(?P<y>\d{2}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Day/MONTH/Year:Hour:Minute:Second",
        r"(?P<d>\d{2})/(?P<b>\S{3})/(?P<Y>\d{4}):(?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Month/Day/Year:Hour:Minute:Second",
        r"(?P<m>\d{2})/(?P<d>\d{2})/(?P<Y>\d{4}):(?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Year-Month-Day Hour:Minute:Second",
        r"(?P<Y>\d{4})-(?P<m>\d{2})-(?P<d>\d{2}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Year.Month.Day Hour:Minute:Second",
        r"(?P<Y>\d{4})\.(?P<m>\d{2})\.(?P<d>\d{2}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Day-MONTH-Year Hour:Minute:Second[.Millisecond]",
        r"(?P<d>\d{2})-(?P<b>\S{3})-(?P<Y>\d{4}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})(?:\.\d{3})?",
        TemplateKind::Fields,
    ),
    (
        "Day-Month-Year Hour:Minute:Second",
        r"(?P<d>\d{2})-(?P<m>\d{2})-(?P<Y>\d{4}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "Month-Day-Year Hour:Minute:Second[.Millisecond]",
        r"(?P<m>\d{2})-(?P<d>\d{2})-(?P<Y>\d{4}) (?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})(?:\.\d{3})?",
        TemplateKind::Fields,
    ),
    ("TAI64N", r"@(?P<x>[0-9a-f]{24})", TemplateKind::Tai64n),
    ("Epoch", r"^(?P<e>\d{10})(?:\.\d{6})?", TemplateKind::Epoch),
    (
        "ISO 8601",
        r"(?P<Y>[0-9]{4})-(?P<m>[0-9]{1,2})-(?P<d>[0-9]{1,2}).(?P<H>[0-9]{2}):(?P<M>[0-9]{2}):(?P<S>[0-9]{2})(?:\.[0-9]+)?(?P<z>Z|[-+][0-9]{2}:[0-9]{2})?",
        TemplateKind::Fields,
    ),
    (
        "Hour:Minute:Second",
        r"^(?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})",
        TemplateKind::Fields,
    ),
    (
        "<Month/Day/Year@Hour:Minute:Second>",
        r"^<(?P<m>\d{2})/(?P<d>\d{2})/(?P<y>\d{2})@(?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})>",
        TemplateKind::Fields,
    ),
];

/// Ordered, self-sorting set of date templates.
pub struct DateDetector {
    templates: RwLock<Vec<DateTemplate>>,
    dirty: AtomicBool,
    zone: Zone,
    clock: SharedClock,
}

impl std::fmt::Debug for DateDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DateDetector")
            .field("templates", &self.templates.read().len())
            .field("zone", &self.zone)
            .finish()
    }
}

impl DateDetector {
    /// An empty detector; see [`DateDetector::with_defaults`].
    pub fn new(clock: SharedClock) -> Self {
        Self {
            templates: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(false),
            zone: Zone::Local,
            clock,
        }
    }

    /// A detector loaded with the built-in templates.
    pub fn with_defaults(clock: SharedClock) -> WardenResult<Self> {
        let detector = Self::new(clock);
        for (name, pattern, kind) in DEFAULT_TEMPLATES {
            detector.add_template(DateTemplate::new(name, pattern, *kind)?);
        }
        Ok(detector)
    }

    /// Interpret zone-less dates at a fixed UTC offset instead of local time.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.zone = Zone::Fixed(offset);
        self
    }

    pub fn add_template(&self, template: DateTemplate) {
        self.templates.write().push(template);
    }

    /// Put a user template built from `pattern` in front of the built-in
    /// ones, replacing any earlier user template.
    pub fn set_pattern(&self, pattern: &str) -> WardenResult<()> {
        let template = DateTemplate::from_pattern(pattern)?;
        debug!("Date pattern {:?} compiled to {}", pattern, template.pattern());
        let mut templates = self.templates.write();
        templates.retain(|t| t.source.is_none());
        templates.insert(0, template);
        Ok(())
    }

    /// The user pattern and its derived name, if one is set.
    pub fn pattern(&self) -> Option<(String, String)> {
        self.templates
            .read()
            .iter()
            .find_map(|t| Some((t.source.clone()?, t.name.clone())))
    }

    /// `(name, hits)` for every template in current order.
    pub fn templates(&self) -> Vec<(String, u64)> {
        self.templates
            .read()
            .iter()
            .map(|t| (t.name.clone(), t.hits()))
            .collect()
    }

    /// Find the date in `line`.
    ///
    /// Templates are tried in order; the first one that matches and converts
    /// wins. If some template matched but none converted, the span of the
    /// first match is returned with `time: None`.
    pub fn detect(&self, line: &str) -> Option<DateMatch> {
        let now = self.clock.now();
        let templates = self.templates.read();
        let mut first_span: Option<(usize, usize)> = None;

        for template in templates.iter() {
            let Some(caps) = template.regex.captures(line) else {
                continue;
            };
            let Some(whole) = caps.get(0) else {
                continue;
            };
            if first_span.is_none() {
                first_span = Some((whole.start(), whole.end()));
            }
            if let Some(time) = self.convert(template.kind, &caps, now) {
                template.hits.fetch_add(1, Ordering::Relaxed);
                self.dirty.store(true, Ordering::Relaxed);
                return Some(DateMatch {
                    start: whole.start(),
                    end: whole.end(),
                    time: Some(time),
                });
            }
        }

        first_span.map(|(start, end)| DateMatch {
            start,
            end,
            time: None,
        })
    }

    /// Shorthand for the timestamp of `line`, if any.
    pub fn unix_time(&self, line: &str) -> Option<i64> {
        self.detect(line).and_then(|m| m.time)
    }

    /// True when hits were recorded since the last sort.
    pub fn needs_sort(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Stable sort by descending hit count. Does nothing if no hit was
    /// recorded since the previous call.
    pub fn sort_by_hits(&self) {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }
        debug!("Sorting the template list");
        // sort_by_key is stable; equal hit counts keep their order
        self.templates
            .write()
            .sort_by_key(|t| std::cmp::Reverse(t.hits()));
    }

    fn convert(&self, kind: TemplateKind, caps: &Captures<'_>, now: i64) -> Option<i64> {
        match kind {
            TemplateKind::Epoch => caps.name("e")?.as_str().parse::<i64>().ok(),
            TemplateKind::Tai64n => {
                let label = caps.name("x")?.as_str();
                let secs = u64::from_str_radix(label.get(..16)?, 16).ok()?;
                let unix = secs.checked_sub(1u64 << 62)?;
                i64::try_from(unix).ok()
            }
            TemplateKind::Fields => self.convert_fields(caps, now),
        }
    }

    fn convert_fields(&self, caps: &Captures<'_>, now: i64) -> Option<i64> {
        let num = |name: &str| -> Option<u32> { caps.name(name)?.as_str().parse().ok() };
        // date-only user patterns mean midnight
        let clock_field = |name: &str| -> Option<u32> {
            match caps.name(name) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(0),
            }
        };

        let time = NaiveTime::from_hms_opt(clock_field("H")?, clock_field("M")?, clock_field("S")?)?;
        let zone = match caps.name("z") {
            Some(z) => Zone::Fixed(parse_offset(z.as_str())?),
            None => self.zone,
        };

        let year = match (caps.name("Y"), caps.name("y")) {
            (Some(y), _) => y.as_str().parse::<i32>().ok(),
            (None, Some(y)) => {
                let short: i32 = y.as_str().parse().ok()?;
                Some(if short < 69 { 2000 + short } else { 1900 + short })
            }
            (None, None) => None,
        };
        let month = match (caps.name("m"), caps.name("b")) {
            (Some(m), _) => m.as_str().parse::<u32>().ok(),
            (None, Some(b)) => Some(month_from_name(b.as_str())?),
            (None, None) => None,
        };
        let day = num("d");

        let today = zone.naive_at(now)?;

        let (Some(month), Some(day)) = (month, day) else {
            // time only: today, or yesterday if that would be in the future
            let ts = zone.to_timestamp(&today.date().and_time(time))?;
            if ts > now {
                let yesterday = today.date() - ChronoDuration::days(1);
                return zone.to_timestamp(&yesterday.and_time(time));
            }
            return Some(ts);
        };

        match year {
            Some(y) if y >= 2000 => {
                let date = NaiveDate::from_ymd_opt(y, month, day)?;
                zone.to_timestamp(&date.and_time(time))
            }
            _ => {
                // no usable year: assume this year unless that lands in the
                // future, then walk back (also covers Feb 29)
                let current = today.year();
                (0..=4).find_map(|back| {
                    let date = NaiveDate::from_ymd_opt(current - back, month, day)?;
                    let ts = zone.to_timestamp(&date.and_time(time))?;
                    if ts > now {
                        if back == 0 {
                            debug!("Correcting deduced year from {} to {}", current, current - 1);
                        }
                        return None;
                    }
                    Some(ts)
                })
            }
        }
    }
}

fn parse_offset(text: &str) -> Option<FixedOffset> {
    if text == "Z" {
        return FixedOffset::east_opt(0);
    }
    let sign = match text.get(..1)? {
        "+" => 1,
        "-" => -1,
        _ => return None,
    };
    let digits = text.get(1..)?.replace(':', "");
    let hours: i32 = digits.get(0..2)?.parse().ok()?;
    let minutes: i32 = digits.get(2..4)?.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Format a Unix timestamp for status output.
pub fn format_time(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
