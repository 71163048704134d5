//! Occurrence generation for the application's recurrence-rule dialect.
//!
//! Rules are persisted as loose JSON (`{"freq": "weekly", "interval": 2,
//! "days_of_week": ["MO", "TH"]}`) and decoded once, at the storage boundary,
//! into [`RecurrenceRule`]. A rule without a recognizable `freq` decodes to
//! `None` and schedules nothing.
//!
//! Generation is pure: the same rule, anchor and window always produce the
//! same dates. Interval phase is counted from the anchor, so a window that
//! advances day by day never shifts which weeks/months are "on".

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// Upper bound on occurrences produced by a single call.
pub const MAX_OCCURRENCES: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthlyPattern {
    /// Same day-of-month as the anchor.
    AnchorDay,
    /// Fixed day, clamped to the last day of shorter months.
    DayOfMonth(u32),
    /// `week` in 1..=5, or -1 for the last such weekday of the month.
    NthWeekday { week: i32, weekday: Weekday },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRecurrenceRule", into = "RawRecurrenceRule")]
pub enum RecurrenceRule {
    Daily {
        interval: u32,
        /// Empty means every day.
        days_of_week: Vec<Weekday>,
    },
    Weekly {
        interval: u32,
        /// Empty means the anchor's weekday.
        days_of_week: Vec<Weekday>,
    },
    Monthly {
        interval: u32,
        pattern: MonthlyPattern,
    },
    Yearly {
        interval: u32,
        month: Option<u32>,
        day: Option<u32>,
    },
}

/// Wire shape of a rule as stored on the task row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecurrenceRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_of_month: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_of_year: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
}

impl RecurrenceRule {
    /// Decodes the stored JSON. Malformed JSON and missing/unknown `freq`
    /// both yield `None`.
    pub fn from_json(raw: &str) -> Option<Self> {
        let parsed: RawRecurrenceRule = serde_json::from_str(raw).ok()?;
        Self::from_raw(&parsed)
    }

    pub fn to_json(&self) -> String {
        // A struct of options and strings always serializes.
        serde_json::to_string(&RawRecurrenceRule::from(self.clone())).unwrap_or_default()
    }

    pub fn from_raw(raw: &RawRecurrenceRule) -> Option<Self> {
        let freq = raw.freq.as_deref()?.trim().to_ascii_lowercase();
        let interval = raw
            .interval
            .unwrap_or(1)
            .clamp(1, i64::from(u32::MAX)) as u32;
        let days_of_week = parse_weekdays(raw.days_of_week.as_deref().unwrap_or_default());

        match freq.as_str() {
            "daily" => Some(Self::Daily {
                interval,
                days_of_week,
            }),
            "weekly" => Some(Self::Weekly {
                interval,
                days_of_week,
            }),
            "monthly" => {
                let nth = raw
                    .week_of_month
                    .filter(|week| (1..=5).contains(week) || *week == -1)
                    .zip(days_of_week.first().copied());
                let pattern = match (nth, valid_day(raw.day_of_month)) {
                    (Some((week, weekday)), _) => MonthlyPattern::NthWeekday {
                        week: week as i32,
                        weekday,
                    },
                    (None, Some(day)) => MonthlyPattern::DayOfMonth(day),
                    (None, None) => MonthlyPattern::AnchorDay,
                };
                Some(Self::Monthly { interval, pattern })
            }
            "yearly" => Some(Self::Yearly {
                interval,
                month: raw
                    .month_of_year
                    .filter(|month| (1..=12).contains(month))
                    .map(|month| month as u32),
                day: valid_day(raw.day_of_month),
            }),
            _ => None,
        }
    }

    pub fn interval(&self) -> u32 {
        match self {
            Self::Daily { interval, .. }
            | Self::Weekly { interval, .. }
            | Self::Monthly { interval, .. }
            | Self::Yearly { interval, .. } => *interval,
        }
    }
}

impl TryFrom<RawRecurrenceRule> for RecurrenceRule {
    type Error = String;

    fn try_from(raw: RawRecurrenceRule) -> Result<Self, Self::Error> {
        Self::from_raw(&raw).ok_or_else(|| "recurrence rule has no recognizable freq".to_string())
    }
}

impl From<RecurrenceRule> for RawRecurrenceRule {
    fn from(rule: RecurrenceRule) -> Self {
        let weekday_codes = |days: &[Weekday]| -> Option<Vec<String>> {
            if days.is_empty() {
                None
            } else {
                Some(days.iter().map(|day| weekday_code(*day).to_string()).collect())
            }
        };
        match rule {
            RecurrenceRule::Daily {
                interval,
                days_of_week,
            } => RawRecurrenceRule {
                freq: Some("daily".to_string()),
                interval: Some(i64::from(interval)),
                days_of_week: weekday_codes(&days_of_week),
                ..Default::default()
            },
            RecurrenceRule::Weekly {
                interval,
                days_of_week,
            } => RawRecurrenceRule {
                freq: Some("weekly".to_string()),
                interval: Some(i64::from(interval)),
                days_of_week: weekday_codes(&days_of_week),
                ..Default::default()
            },
            RecurrenceRule::Monthly { interval, pattern } => {
                let mut raw = RawRecurrenceRule {
                    freq: Some("monthly".to_string()),
                    interval: Some(i64::from(interval)),
                    ..Default::default()
                };
                match pattern {
                    MonthlyPattern::AnchorDay => {}
                    MonthlyPattern::DayOfMonth(day) => raw.day_of_month = Some(i64::from(day)),
                    MonthlyPattern::NthWeekday { week, weekday } => {
                        raw.week_of_month = Some(i64::from(week));
                        raw.days_of_week = Some(vec![weekday_code(weekday).to_string()]);
                    }
                }
                raw
            }
            RecurrenceRule::Yearly {
                interval,
                month,
                day,
            } => RawRecurrenceRule {
                freq: Some("yearly".to_string()),
                interval: Some(i64::from(interval)),
                month_of_year: month.map(i64::from),
                day_of_month: day.map(i64::from),
                ..Default::default()
            },
        }
    }
}

/// Occurrences in `[start, end]` with the interval phase anchored at `start`.
///
/// `None` for the rule is the normal "nothing to schedule" state and yields
/// an empty sequence.
pub fn generate(
    rule: Option<&RecurrenceRule>,
    start: NaiveDate,
    end: NaiveDate,
    default_time: Option<NaiveTime>,
) -> Vec<Occurrence> {
    generate_anchored(rule, start, start, end, default_time)
}

/// Occurrences in `[start, end]`, never earlier than `anchor`, with the
/// interval phase counted from `anchor`.
pub fn generate_anchored(
    rule: Option<&RecurrenceRule>,
    anchor: NaiveDate,
    start: NaiveDate,
    end: NaiveDate,
    default_time: Option<NaiveTime>,
) -> Vec<Occurrence> {
    let Some(rule) = rule else {
        return Vec::new();
    };
    let lower = start.max(anchor);
    if end < lower {
        return Vec::new();
    }

    let dates = match rule {
        RecurrenceRule::Daily {
            interval,
            days_of_week,
        } => daily_dates(*interval, days_of_week, anchor, lower, end),
        RecurrenceRule::Weekly {
            interval,
            days_of_week,
        } => weekly_dates(*interval, days_of_week, anchor, lower, end),
        RecurrenceRule::Monthly { interval, pattern } => {
            monthly_dates(*interval, *pattern, anchor, lower, end)
        }
        RecurrenceRule::Yearly {
            interval,
            month,
            day,
        } => yearly_dates(*interval, *month, *day, anchor, lower, end),
    };

    dates
        .into_iter()
        .map(|date| Occurrence {
            date,
            time: default_time,
        })
        .collect()
}

fn daily_dates(
    interval: u32,
    days_of_week: &[Weekday],
    anchor: NaiveDate,
    lower: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    let step = i64::from(interval);
    let offset = (lower - anchor).num_days();
    let mut dates = Vec::new();
    let mut next = add_days(anchor, ceil_to_multiple(offset, step));

    while let Some(current) = next.filter(|date| *date <= end) {
        if dates.len() >= MAX_OCCURRENCES {
            break;
        }
        if days_of_week.is_empty() || days_of_week.contains(&current.weekday()) {
            dates.push(current);
        }
        next = add_days(current, step);
    }
    dates
}

fn weekly_dates(
    interval: u32,
    days_of_week: &[Weekday],
    anchor: NaiveDate,
    lower: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    let fallback = [anchor.weekday()];
    let days = if days_of_week.is_empty() {
        &fallback[..]
    } else {
        days_of_week
    };

    let step_days = i64::from(interval).saturating_mul(7);
    let anchor_week = week_start(anchor);
    let weeks_to_lower = (week_start(lower) - anchor_week).num_days() / 7;
    let mut dates = Vec::new();
    let mut next = add_days(
        anchor_week,
        ceil_to_multiple(weeks_to_lower, i64::from(interval)).saturating_mul(7),
    );

    while let Some(current_week) = next.filter(|week| *week <= end) {
        for day in days {
            let Some(date) = add_days(current_week, i64::from(day.num_days_from_monday())) else {
                continue;
            };
            if date >= lower && date <= end && dates.len() < MAX_OCCURRENCES {
                dates.push(date);
            }
        }
        if dates.len() >= MAX_OCCURRENCES {
            break;
        }
        next = add_days(current_week, step_days);
    }
    dates
}

fn monthly_dates(
    interval: u32,
    pattern: MonthlyPattern,
    anchor: NaiveDate,
    lower: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    let step = i64::from(interval);
    let anchor_index = month_index(anchor);
    let months_to_lower = month_index(lower) - anchor_index;
    let mut index = anchor_index + ceil_to_multiple(months_to_lower, step);
    let mut dates = Vec::new();

    while dates.len() < MAX_OCCURRENCES {
        let Some((year, month)) = from_month_index(index) else {
            break;
        };
        let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
            break;
        };
        if first > end {
            break;
        }
        let candidate = match pattern {
            MonthlyPattern::AnchorDay => clamped_date(year, month, anchor.day()),
            MonthlyPattern::DayOfMonth(day) => clamped_date(year, month, day),
            MonthlyPattern::NthWeekday { week, weekday } => nth_weekday(year, month, week, weekday),
        };
        if let Some(date) = candidate.filter(|date| *date >= lower && *date <= end) {
            dates.push(date);
        }
        index += step;
    }
    dates
}

fn yearly_dates(
    interval: u32,
    month: Option<u32>,
    day: Option<u32>,
    anchor: NaiveDate,
    lower: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    let step = i64::from(interval);
    let month = month.unwrap_or_else(|| anchor.month());
    let day = day.unwrap_or_else(|| anchor.day());
    let years_to_lower = i64::from(lower.year() - anchor.year());
    let mut year = i64::from(anchor.year()) + ceil_to_multiple(years_to_lower, step);
    let mut dates = Vec::new();

    while year <= i64::from(end.year()) && dates.len() < MAX_OCCURRENCES {
        let Ok(calendar_year) = i32::try_from(year) else {
            break;
        };
        if let Some(date) = clamped_date(calendar_year, month, day).filter(|date| *date >= lower && *date <= end) {
            dates.push(date);
        }
        year += step;
    }
    dates
}

/// `None` once the step runs past the last representable date.
fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    date.checked_add_signed(Duration::try_days(days)?)
}

/// Smallest multiple of `step` that is >= `value` (value >= 0).
fn ceil_to_multiple(value: i64, step: i64) -> i64 {
    if value <= 0 {
        return 0;
    }
    ((value + step - 1) / step) * step
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn from_month_index(index: i64) -> Option<(i32, u32)> {
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    Some((year, index.rem_euclid(12) as u32 + 1))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
    Some(first_of_next.pred_opt()?.day())
}

fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let last = days_in_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, last))
}

fn nth_weekday(year: i32, month: u32, week: i32, weekday: Weekday) -> Option<NaiveDate> {
    let last_day = days_in_month(year, month)?;
    if week == -1 {
        let last = NaiveDate::from_ymd_opt(year, month, last_day)?;
        let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
        return Some(last - Duration::days(i64::from(back)));
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let forward = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    let day = 1 + forward + 7 * (week.max(1) as u32 - 1);
    // A fifth occurrence does not exist in every month.
    if day > last_day {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn valid_day(value: Option<i64>) -> Option<u32> {
    value.filter(|day| (1..=31).contains(day)).map(|day| day as u32)
}

fn parse_weekdays(codes: &[String]) -> Vec<Weekday> {
    let mut days: Vec<Weekday> = codes.iter().filter_map(|code| parse_weekday(code)).collect();
    days.sort_by_key(|day| day.num_days_from_monday());
    days.dedup();
    days
}

pub fn parse_weekday(code: &str) -> Option<Weekday> {
    let code = code.trim().to_ascii_uppercase();
    let prefix = code.get(..2)?;
    match prefix {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn weekday_code(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn dates(occurrences: &[Occurrence]) -> Vec<NaiveDate> {
        occurrences.iter().map(|occurrence| occurrence.date).collect()
    }

    fn rule(json: &str) -> RecurrenceRule {
        RecurrenceRule::from_json(json).expect("rule decodes")
    }

    #[test]
    fn daily_rule_includes_both_window_ends() {
        let daily = rule(r#"{"freq":"daily","interval":1}"#);
        let start = date("2026-02-20");
        let occurrences = generate(Some(&daily), start, start + Duration::days(3), None);

        assert_eq!(
            dates(&occurrences),
            vec![
                date("2026-02-20"),
                date("2026-02-21"),
                date("2026-02-22"),
                date("2026-02-23"),
            ]
        );
    }

    #[test]
    fn weekly_rule_restricts_to_listed_weekdays() {
        let weekly = rule(r#"{"freq":"weekly","interval":1,"days_of_week":["MO","WE","FR"]}"#);
        let monday = date("2026-02-16");
        let occurrences = generate(Some(&weekly), monday, monday + Duration::days(13), None);

        assert_eq!(occurrences.len(), 6);
        assert!(occurrences.iter().all(|occurrence| matches!(
            occurrence.date.weekday(),
            Weekday::Mon | Weekday::Wed | Weekday::Fri
        )));
    }

    #[test]
    fn biweekly_phase_follows_anchor_not_window() {
        let biweekly = rule(r#"{"freq":"weekly","interval":2,"days_of_week":["TU"]}"#);
        let anchor = date("2026-02-16");
        let occurrences = generate_anchored(
            Some(&biweekly),
            anchor,
            date("2026-02-23"),
            date("2026-03-22"),
            None,
        );

        assert_eq!(dates(&occurrences), vec![date("2026-03-03"), date("2026-03-17")]);
    }

    #[test]
    fn monthly_nth_weekday() {
        let second_monday = rule(r#"{"freq":"monthly","week_of_month":2,"days_of_week":["MO"]}"#);
        let occurrences = generate(
            Some(&second_monday),
            date("2026-03-01"),
            date("2026-04-30"),
            None,
        );
        assert_eq!(dates(&occurrences), vec![date("2026-03-09"), date("2026-04-13")]);

        let last_friday = rule(r#"{"freq":"monthly","week_of_month":-1,"days_of_week":["FR"]}"#);
        let occurrences = generate(Some(&last_friday), date("2026-02-01"), date("2026-02-28"), None);
        assert_eq!(dates(&occurrences), vec![date("2026-02-27")]);
    }

    #[test]
    fn monthly_day_of_month_clamps_to_short_months() {
        let end_of_month = rule(r#"{"freq":"monthly","day_of_month":31}"#);
        let occurrences = generate(
            Some(&end_of_month),
            date("2026-01-01"),
            date("2026-04-30"),
            None,
        );

        assert_eq!(
            dates(&occurrences),
            vec![
                date("2026-01-31"),
                date("2026-02-28"),
                date("2026-03-31"),
                date("2026-04-30"),
            ]
        );
    }

    #[test]
    fn yearly_rule_uses_fixed_month_and_day() {
        let yearly = rule(r#"{"freq":"yearly","month_of_year":3,"day_of_month":14}"#);
        let occurrences = generate(Some(&yearly), date("2026-01-01"), date("2028-12-31"), None);

        assert_eq!(
            dates(&occurrences),
            vec![date("2026-03-14"), date("2027-03-14"), date("2028-03-14")]
        );
    }

    #[test]
    fn missing_or_unknown_freq_is_inert() {
        assert_eq!(RecurrenceRule::from_json(r#"{"interval":2}"#), None);
        assert_eq!(RecurrenceRule::from_json(r#"{"freq":"hourly"}"#), None);
        assert_eq!(RecurrenceRule::from_json("not json"), None);
        assert!(generate(None, date("2026-01-01"), date("2026-12-31"), None).is_empty());
    }

    #[test]
    fn reversed_window_is_empty() {
        let daily = rule(r#"{"freq":"daily"}"#);
        assert!(generate(Some(&daily), date("2026-02-10"), date("2026-02-01"), None).is_empty());
    }

    #[test]
    fn huge_intervals_end_the_sequence_instead_of_overflowing() {
        let start = date("2026-02-20");
        let end = start + Duration::days(60);
        for json in [
            r#"{"freq":"daily","interval":100000000}"#,
            r#"{"freq":"weekly","interval":20000000}"#,
            r#"{"freq":"monthly","interval":4294967295}"#,
            r#"{"freq":"yearly","interval":4294967295}"#,
        ] {
            let huge = rule(json);
            assert_eq!(dates(&generate(Some(&huge), start, end, None)), vec![start], "{json}");

            // Anchored in the past, the first step already lands beyond the window.
            let anchored = generate_anchored(Some(&huge), date("2020-01-06"), start, end, None);
            assert!(anchored.is_empty(), "{json}");
        }
    }

    #[test]
    fn zero_interval_is_treated_as_one() {
        let daily = rule(r#"{"freq":"daily","interval":0}"#);
        assert_eq!(daily.interval(), 1);
    }

    #[test]
    fn default_time_is_attached_to_every_occurrence() {
        let daily = rule(r#"{"freq":"daily"}"#);
        let nine = NaiveTime::from_hms_opt(9, 0, 0);
        let occurrences = generate(Some(&daily), date("2026-02-01"), date("2026-02-03"), nine);
        assert!(occurrences.iter().all(|occurrence| occurrence.time == nine));
    }

    #[test]
    fn stored_json_keeps_the_rule() {
        let nth = rule(r#"{"freq":"monthly","interval":3,"week_of_month":1,"days_of_week":["WE"]}"#);
        assert_eq!(RecurrenceRule::from_json(&nth.to_json()), Some(nth));
    }

    fn arb_rule() -> impl Strategy<Value = RecurrenceRule> {
        let weekdays = prop::collection::vec(0u8..7, 0..4).prop_map(|indexes| {
            let codes: Vec<String> = indexes
                .into_iter()
                .map(|index| ["MO", "TU", "WE", "TH", "FR", "SA", "SU"][index as usize].to_string())
                .collect();
            parse_weekdays(&codes)
        });
        prop_oneof![
            (1u32..5, weekdays.clone())
                .prop_map(|(interval, days_of_week)| RecurrenceRule::Daily { interval, days_of_week }),
            (1u32..5, weekdays)
                .prop_map(|(interval, days_of_week)| RecurrenceRule::Weekly { interval, days_of_week }),
            (1u32..4, 1u32..32).prop_map(|(interval, day)| RecurrenceRule::Monthly {
                interval,
                pattern: MonthlyPattern::DayOfMonth(day),
            }),
            (1u32..3, 1u32..13, 1u32..32).prop_map(|(interval, month, day)| RecurrenceRule::Yearly {
                interval,
                month: Some(month),
                day: Some(day),
            }),
        ]
    }

    // Feature: cadence, Property 3: generation is deterministic, ascending and duplicate-free
    proptest! {
        #[test]
        fn property3_generation_is_deterministic(
            rule in arb_rule(),
            offset in 0i64..400,
            span in 0i64..400
        ) {
            let start = date("2025-01-01") + Duration::days(offset);
            let end = start + Duration::days(span);
            let first = generate(Some(&rule), start, end, None);
            let second = generate(Some(&rule), start, end, None);

            prop_assert_eq!(&first, &second);
            prop_assert!(first.windows(2).all(|pair| pair[0].date < pair[1].date));
            prop_assert!(first.iter().all(|occurrence| occurrence.date >= start && occurrence.date <= end));
        }
    }

    // Feature: cadence, Property 4: an advancing window never shifts the anchored phase
    proptest! {
        #[test]
        fn property4_split_windows_match_whole_window(
            rule in arb_rule(),
            split in 0i64..300,
            span in 300i64..500
        ) {
            let anchor = date("2025-06-15");
            let end = anchor + Duration::days(span);
            let middle = anchor + Duration::days(split);

            let whole = generate_anchored(Some(&rule), anchor, anchor, end, None);
            let mut pieces = generate_anchored(Some(&rule), anchor, anchor, middle, None);
            pieces.extend(generate_anchored(Some(&rule), anchor, middle + Duration::days(1), end, None));

            prop_assert_eq!(whole, pieces);
        }
    }
}
