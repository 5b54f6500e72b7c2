//! Core domain model for the tech ephemeris: publication keys, date
//! resolution, category normalization and content validation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ephem-core";

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Madrid;

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// English month name for a 1-based month number.
pub fn month_name(month: u32) -> Option<&'static str> {
    month
        .checked_sub(1)
        .and_then(|idx| MONTH_NAMES.get(idx as usize))
        .copied()
}

pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(next.signed_duration_since(first).num_days() as u32)
}

pub fn ordinal_suffix(day: u32) -> &'static str {
    if (4..=20).contains(&(day % 100)) {
        return "th";
    }
    match day % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

/// Long display form, e.g. `7th of January`.
pub fn format_date_long(day: u32, month: u32) -> Option<String> {
    let name = month_name(month)?;
    Some(format!("{day}{} of {name}", ordinal_suffix(day)))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("invalid date override {input:?}: expected YYYY-MM-DD")]
    Malformed { input: String },
    #[error("date override {input:?} is not a real calendar day")]
    Nonexistent { input: String },
    #[error("no calendar day follows {0}")]
    OutOfRange(NaiveDate),
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

/// The (day, month, year) slot a record is filed under. Always a real
/// calendar day; the year is the publication year, not the historical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "KeyParts", try_from = "KeyParts")]
pub struct PublicationKey(NaiveDate);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct KeyParts {
    day: u32,
    month: u32,
    year: i32,
}

impl From<PublicationKey> for KeyParts {
    fn from(key: PublicationKey) -> Self {
        Self {
            day: key.day(),
            month: key.month(),
            year: key.year(),
        }
    }
}

impl TryFrom<KeyParts> for PublicationKey {
    type Error = DateError;

    fn try_from(parts: KeyParts) -> Result<Self, Self::Error> {
        PublicationKey::from_parts(parts.day, parts.month, parts.year)
    }
}

impl PublicationKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_parts(day: u32, month: u32, year: i32) -> Result<Self, DateError> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| DateError::Nonexistent {
                input: format!("{year:04}-{month:02}-{day:02}"),
            })
    }

    /// Parses a strict `YYYY-MM-DD` override.
    pub fn parse(input: &str) -> Result<Self, DateError> {
        let trimmed = input.trim();
        let malformed = || DateError::Malformed {
            input: input.to_string(),
        };

        let parts: Vec<&str> = trimmed.split('-').collect();
        let [year, month, day] = parts.as_slice() else {
            return Err(malformed());
        };
        let well_shaped = [(year, 4), (month, 2), (day, 2)]
            .iter()
            .all(|(part, len)| part.len() == *len && part.bytes().all(|b| b.is_ascii_digit()));
        if !well_shaped {
            return Err(malformed());
        }

        let year: i32 = year.parse().map_err(|_| malformed())?;
        let month: u32 = month.parse().map_err(|_| malformed())?;
        let day: u32 = day.parse().map_err(|_| malformed())?;
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| DateError::Nonexistent {
                input: trimmed.to_string(),
            })
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn day(&self) -> u32 {
        self.0.day()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month_name(&self) -> &'static str {
        MONTH_NAMES[self.0.month0() as usize]
    }

    /// `"<MonthName> <day>"`, the label shown for the publication date.
    pub fn display_date(&self) -> String {
        format!("{} {}", self.month_name(), self.day())
    }

    pub fn succ(&self) -> Result<Self, DateError> {
        self.0
            .succ_opt()
            .map(Self)
            .ok_or(DateError::OutOfRange(self.0))
    }
}

impl fmt::Display for PublicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for PublicationKey {
    type Err = DateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Override,
    TomorrowInZone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub key: PublicationKey,
    pub source: TargetSource,
}

/// Resolves publication keys against a named civil timezone.
///
/// Write-side targets are "tomorrow as seen in the zone": the instant is
/// converted to the zone's civil date first and then stepped by one
/// calendar day, so a 23- or 25-hour DST day never skips or repeats a date.
#[derive(Debug, Clone, Copy)]
pub struct DateResolver {
    timezone: Tz,
}

impl Default for DateResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEZONE)
    }
}

impl DateResolver {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn from_name(name: &str) -> Result<Self, DateError> {
        name.trim()
            .parse::<Tz>()
            .map(Self::new)
            .map_err(|_| DateError::UnknownTimezone(name.to_string()))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn today_in_zone(&self, now: DateTime<Utc>) -> PublicationKey {
        PublicationKey(now.with_timezone(&self.timezone).date_naive())
    }

    pub fn tomorrow_in_zone(&self, now: DateTime<Utc>) -> Result<PublicationKey, DateError> {
        self.today_in_zone(now).succ()
    }

    /// An explicit override wins; a blank override counts as absent.
    pub fn resolve_target(
        &self,
        override_date: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ResolvedTarget, DateError> {
        match override_date.map(str::trim).filter(|s| !s.is_empty()) {
            Some(input) => Ok(ResolvedTarget {
                key: PublicationKey::parse(input)?,
                source: TargetSource::Override,
            }),
            None => Ok(ResolvedTarget {
                key: self.tomorrow_in_zone(now)?,
                source: TargetSource::TomorrowInZone,
            }),
        }
    }
}

/// Read-side basis: the UTC calendar day, independent of the writer's zone.
pub fn today_utc(now: DateTime<Utc>) -> PublicationKey {
    PublicationKey(now.date_naive())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Ai,
    Tech,
    Computing,
    Science,
}

pub const FALLBACK_CATEGORY: Category = Category::Science;

/// Labels models drift towards, folded onto the closed set.
pub const CATEGORY_ALIASES: &[(&str, Category)] = &[
    ("MEDICAL", Category::Science),
    ("MEDICINE", Category::Science),
    ("HEALTH", Category::Science),
    ("BIOLOGY", Category::Science),
    ("PHYSICS", Category::Science),
    ("CHEMISTRY", Category::Science),
    ("MATHEMATICS", Category::Science),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category {0:?}")]
pub struct UnknownCategory(pub String);

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Ai,
        Category::Tech,
        Category::Computing,
        Category::Science,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Ai => "AI",
            Category::Tech => "TECH",
            Category::Computing => "COMPUTING",
            Category::Science => "SCIENCE",
        }
    }

    pub fn labels() -> Vec<&'static str> {
        Self::ALL.iter().map(Category::as_str).collect()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == upper)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryAdjustment {
    Mapped { original: String },
    Fallback { original: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCategory {
    pub category: Category,
    pub adjustment: Option<CategoryAdjustment>,
}

/// Total mapping from any label onto [`Category`]. Never fails; callers
/// decide how loudly to report an adjustment.
pub fn normalize_category(raw: &str) -> NormalizedCategory {
    if let Ok(category) = raw.parse::<Category>() {
        return NormalizedCategory {
            category,
            adjustment: None,
        };
    }

    let upper = raw.trim().to_uppercase();
    match CATEGORY_ALIASES.iter().find(|(alias, _)| *alias == upper) {
        Some((_, category)) => NormalizedCategory {
            category: *category,
            adjustment: Some(CategoryAdjustment::Mapped {
                original: raw.to_string(),
            }),
        },
        None => NormalizedCategory {
            category: FALLBACK_CATEGORY,
            adjustment: Some(CategoryAdjustment::Fallback {
                original: raw.to_string(),
            }),
        },
    }
}

/// True when `text` names both the day number and the month.
///
/// Matching is plain substring containment on lowercased text; the year is
/// not inspected because the key's year is the publication slot.
pub fn content_mentions_date(text: &str, day: u32, month_name: &str) -> bool {
    let haystack = text.to_lowercase();
    haystack.contains(&day.to_string()) && haystack.contains(&month_name.to_lowercase())
}

/// Model output before it has been normalized and validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationCandidate {
    pub title: String,
    pub description: String,
    pub category: String,
    pub source_url: String,
}

impl GenerationCandidate {
    /// Rewrites `category` to its normalized label in place.
    pub fn normalize_category(&mut self) -> NormalizedCategory {
        let normalized = normalize_category(&self.category);
        self.category = normalized.category.as_str().to_string();
        normalized
    }

    pub fn combined_text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }

    pub fn mentions_date(&self, key: &PublicationKey) -> bool {
        content_mentions_date(&self.combined_text(), key.day(), key.month_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemerisRecord {
    #[serde(flatten)]
    pub key: PublicationKey,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub display_date: String,
    pub source_url: String,
}

impl EphemerisRecord {
    pub fn new(key: PublicationKey, candidate: GenerationCandidate, category: Category) -> Self {
        Self {
            key,
            title: candidate.title,
            description: candidate.description,
            category,
            display_date: key.display_date(),
            source_url: candidate.source_url,
        }
    }
}

/// A record as handed back by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEphemeris {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: EphemerisRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn key(s: &str) -> PublicationKey {
        PublicationKey::parse(s).expect("key")
    }

    #[test]
    fn explicit_overrides_round_trip() {
        for (input, day, month, year) in [
            ("2026-01-14", 14, 1, 2026),
            ("2024-02-29", 29, 2, 2024),
            ("1999-12-31", 31, 12, 1999),
            (" 2026-07-01\n", 1, 7, 2026),
        ] {
            let k = PublicationKey::parse(input).expect("parses");
            assert_eq!((k.day(), k.month(), k.year()), (day, month, year), "{input}");
        }
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        for input in ["", "2026-1-14", "14-01-2026", "2026/01/14", "2026-01-14T00:00", "abcd-ef-gh"] {
            assert!(
                matches!(PublicationKey::parse(input), Err(DateError::Malformed { .. })),
                "{input:?}"
            );
        }
        assert!(matches!(
            PublicationKey::parse("2026-02-30"),
            Err(DateError::Nonexistent { .. })
        ));
        assert!(matches!(
            PublicationKey::parse("2025-02-29"),
            Err(DateError::Nonexistent { .. })
        ));
    }

    #[test]
    fn tomorrow_rolls_over_month_and_year() {
        let resolver = DateResolver::default();
        assert_eq!(
            resolver.tomorrow_in_zone(utc("2026-01-31T10:00:00Z")).unwrap(),
            key("2026-02-01")
        );
        assert_eq!(
            resolver.tomorrow_in_zone(utc("2026-12-31T10:00:00Z")).unwrap(),
            key("2027-01-01")
        );
    }

    #[test]
    fn tomorrow_uses_the_zone_civil_date_not_utc() {
        let resolver = DateResolver::default();
        // 23:30 UTC on New Year's Eve is already 00:30 on Jan 1 in Madrid.
        let now = utc("2026-12-31T23:30:00Z");
        assert_eq!(resolver.today_in_zone(now), key("2027-01-01"));
        assert_eq!(resolver.tomorrow_in_zone(now).unwrap(), key("2027-01-02"));
        assert_eq!(today_utc(now), key("2026-12-31"));
    }

    #[test]
    fn tomorrow_is_calendar_tomorrow_across_spring_forward() {
        // Madrid jumps 02:00 -> 03:00 on 2026-03-29; that civil day has 23 hours.
        let resolver = DateResolver::default();
        let before = utc("2026-03-28T22:30:00Z"); // 23:30 CET, Mar 28
        let after = utc("2026-03-29T22:30:00Z"); // 00:30 CEST, Mar 30
        assert_eq!(resolver.tomorrow_in_zone(before).unwrap(), key("2026-03-29"));
        assert_eq!(resolver.tomorrow_in_zone(after).unwrap(), key("2026-03-31"));

        let during = utc("2026-03-29T00:30:00Z"); // 01:30 CET, Mar 29
        assert_eq!(resolver.tomorrow_in_zone(during).unwrap(), key("2026-03-30"));
    }

    #[test]
    fn tomorrow_is_calendar_tomorrow_across_fall_back() {
        // Madrid repeats 02:00-03:00 on 2026-10-25; that civil day has 25 hours.
        let resolver = DateResolver::default();
        let early = utc("2026-10-24T22:30:00Z"); // 00:30 CEST, Oct 25
        let late = utc("2026-10-25T22:30:00Z"); // 23:30 CET, Oct 25
        assert_eq!(resolver.tomorrow_in_zone(early).unwrap(), key("2026-10-26"));
        assert_eq!(resolver.tomorrow_in_zone(late).unwrap(), key("2026-10-26"));
    }

    #[test]
    fn resolve_target_prefers_override_and_ignores_blank() {
        let resolver = DateResolver::from_name("Europe/Madrid").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 12, 0, 0).single().unwrap();

        let explicit = resolver.resolve_target(Some("2026-01-14"), now).unwrap();
        assert_eq!(explicit.key, key("2026-01-14"));
        assert_eq!(explicit.source, TargetSource::Override);

        let blank = resolver.resolve_target(Some("  "), now).unwrap();
        assert_eq!(blank.key, key("2026-05-11"));
        assert_eq!(blank.source, TargetSource::TomorrowInZone);

        assert!(resolver.resolve_target(Some("tomorrow"), now).is_err());
    }

    #[test]
    fn unknown_timezone_is_reported() {
        assert_eq!(
            DateResolver::from_name("Mars/Olympus").unwrap_err(),
            DateError::UnknownTimezone("Mars/Olympus".into())
        );
    }

    #[test]
    fn normalizer_is_total_and_idempotent() {
        let inputs = [
            "AI", " tech ", "Computing", "science", "PHYSICS", "medical", "Mathematics",
            "ROBOTICS", "", "   ", "🚀", "space exploration",
        ];
        for input in inputs {
            let once = normalize_category(input);
            assert!(Category::ALL.contains(&once.category), "{input:?}");
            let twice = normalize_category(once.category.as_str());
            assert_eq!(twice.category, once.category, "{input:?}");
            assert_eq!(twice.adjustment, None, "{input:?}");
        }
    }

    #[test]
    fn normalizer_reports_how_a_label_was_resolved() {
        assert_eq!(normalize_category(" tech\t").adjustment, None);
        assert_eq!(normalize_category(" tech\t").category, Category::Tech);

        let mapped = normalize_category("Physics");
        assert_eq!(mapped.category, Category::Science);
        assert_eq!(
            mapped.adjustment,
            Some(CategoryAdjustment::Mapped {
                original: "Physics".into()
            })
        );

        let fallback = normalize_category("Robotics");
        assert_eq!(fallback.category, FALLBACK_CATEGORY);
        assert!(matches!(fallback.adjustment, Some(CategoryAdjustment::Fallback { .. })));
    }

    #[test]
    fn candidate_category_is_rewritten_in_place() {
        let mut candidate = GenerationCandidate {
            title: "t".into(),
            description: "d".into(),
            category: "chemistry".into(),
            source_url: "https://example.org".into(),
        };
        let normalized = candidate.normalize_category();
        assert_eq!(normalized.category, Category::Science);
        assert_eq!(candidate.category, "SCIENCE");
    }

    #[test]
    fn validator_needs_day_and_month_case_insensitively() {
        assert!(content_mentions_date("ENIAC unveiled on JANUARY 14, 1946", 14, "January"));
        assert!(content_mentions_date("on january 14", 14, "January"));
        assert!(!content_mentions_date("ENIAC unveiled in February 1946", 14, "January"));
        assert!(!content_mentions_date("Unveiled on the 14th", 14, "January"));
        assert!(!content_mentions_date("", 14, "January"));
    }

    #[test]
    fn record_display_date_uses_the_publication_key() {
        let candidate = GenerationCandidate {
            title: "ENIAC unveiled in 1946".into(),
            description: "On January 14, 1946 ...".into(),
            category: "SCIENCE".into(),
            source_url: "https://en.wikipedia.org/wiki/ENIAC".into(),
        };
        let record = EphemerisRecord::new(key("2026-01-14"), candidate, Category::Science);
        assert_eq!(record.display_date, "January 14");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["day"], 14);
        assert_eq!(json["month"], 1);
        assert_eq!(json["year"], 2026);
        assert_eq!(json["category"], "SCIENCE");
    }

    #[test]
    fn date_helpers() {
        assert_eq!(month_name(1), Some("January"));
        assert_eq!(month_name(0), None);
        assert_eq!(month_name(13), None);
        assert_eq!(days_in_month(2024, 2), Some(29));
        assert_eq!(days_in_month(2026, 2), Some(28));
        assert_eq!(days_in_month(2026, 12), Some(31));
        assert_eq!(format_date_long(7, 1).as_deref(), Some("7th of January"));
        assert_eq!(format_date_long(1, 3).as_deref(), Some("1st of March"));
        assert_eq!(format_date_long(22, 5).as_deref(), Some("22nd of May"));
        assert_eq!(format_date_long(13, 5).as_deref(), Some("13th of May"));
        assert_eq!(format_date_long(23, 5).as_deref(), Some("23rd of May"));
    }
}
