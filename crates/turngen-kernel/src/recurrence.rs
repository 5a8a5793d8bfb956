//! Recurrence engine.
//!
//! A [RecurrenceRule] expands a repeating sequence of instants (frequency and
//! interval, bounded by count/until, filtered by the `by_*` constraints). A
//! [RecurrenceSet] is the union of its rules: its next instant after a cutoff
//! is the minimum over every rule's own next instant.
//!
//! All instants are evaluated in UTC. Weeks start on Monday and weekday
//! numbers run from 0 (Monday) to 6 (Sunday).

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Last year the engine will search into.
const MAX_YEAR: i32 = 9999;

/// Search window (in years, scaled by the interval) before a rule whose
/// constraints never match is treated as exhausted.
const HORIZON_YEARS: i64 = 400;

/// Base period of a rule. Ordered from coarsest to finest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Yearly,
    Monthly,
    Weekly,
    Daily,
    Hourly,
    Minutely,
}

/// One recurrence rule. Empty `by_*` lists mean "unconstrained".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Anchor of the sequence. When absent the evaluation instant, truncated
    /// to the minute, is used.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub count: Option<u32>,
    /// Inclusive upper bound.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub by_set_pos: Vec<i32>,
    #[serde(default)]
    pub by_month: Vec<i32>,
    #[serde(default)]
    pub by_month_day: Vec<i32>,
    #[serde(default)]
    pub by_year_day: Vec<i32>,
    #[serde(default)]
    pub by_week_no: Vec<i32>,
    #[serde(default)]
    pub by_weekday: Vec<i32>,
    #[serde(default)]
    pub by_hour: Vec<i32>,
    #[serde(default)]
    pub by_minute: Vec<i32>,
}

impl RecurrenceRule {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            start: None,
            interval: None,
            count: None,
            until: None,
            by_set_pos: Vec::new(),
            by_month: Vec::new(),
            by_month_day: Vec::new(),
            by_year_day: Vec::new(),
            by_week_no: Vec::new(),
            by_weekday: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
        }
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_set_positions(mut self, positions: impl Into<Vec<i32>>) -> Self {
        self.by_set_pos = positions.into();
        self
    }

    pub fn with_months(mut self, months: impl Into<Vec<i32>>) -> Self {
        self.by_month = months.into();
        self
    }

    pub fn with_month_days(mut self, days: impl Into<Vec<i32>>) -> Self {
        self.by_month_day = days.into();
        self
    }

    pub fn with_year_days(mut self, days: impl Into<Vec<i32>>) -> Self {
        self.by_year_day = days.into();
        self
    }

    pub fn with_week_numbers(mut self, weeks: impl Into<Vec<i32>>) -> Self {
        self.by_week_no = weeks.into();
        self
    }

    pub fn with_weekdays(mut self, weekdays: impl Into<Vec<i32>>) -> Self {
        self.by_weekday = weekdays.into();
        self
    }

    pub fn with_hours(mut self, hours: impl Into<Vec<i32>>) -> Self {
        self.by_hour = hours.into();
        self
    }

    pub fn with_minutes(mut self, minutes: impl Into<Vec<i32>>) -> Self {
        self.by_minute = minutes.into();
        self
    }

    /// Checks every constraint list against its calendar range.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.interval == Some(0) {
            return Err(KernelError::InvalidRule("interval must be at least 1".into()));
        }
        if let (Some(start), Some(until)) = (self.start, self.until) {
            if until < start {
                return Err(KernelError::InvalidRule(
                    "until must not precede start".into(),
                ));
            }
        }
        check_signed("by_set_pos", &self.by_set_pos, 366)?;
        check_range("by_month", &self.by_month, 1, 12)?;
        check_signed("by_month_day", &self.by_month_day, 31)?;
        check_signed("by_year_day", &self.by_year_day, 366)?;
        check_signed("by_week_no", &self.by_week_no, 53)?;
        check_range("by_weekday", &self.by_weekday, 0, 6)?;
        check_range("by_hour", &self.by_hour, 0, 23)?;
        check_range("by_minute", &self.by_minute, 0, 59)?;
        Ok(())
    }

    /// Earliest occurrence strictly after `cutoff`, or `None` when the rule is
    /// exhausted. `now` anchors rules without an explicit start.
    pub fn next_after(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let anchor = match self.start {
            Some(start) => truncate_to_second(start.naive_utc()),
            None => truncate_to_minute(now.naive_utc()),
        };
        Expansion::new(self, anchor)
            .next_after(cutoff.naive_utc())
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

fn check_range(name: &str, values: &[i32], min: i32, max: i32) -> Result<(), KernelError> {
    match values.iter().find(|v| **v < min || **v > max) {
        Some(bad) => Err(KernelError::InvalidRule(format!(
            "{name} value {bad} outside {min}..={max}"
        ))),
        None => Ok(()),
    }
}

fn check_signed(name: &str, values: &[i32], max: i32) -> Result<(), KernelError> {
    match values.iter().find(|v| **v == 0 || v.abs() > max) {
        Some(bad) => Err(KernelError::InvalidRule(format!(
            "{name} value {bad} outside ±1..={max}"
        ))),
        None => Ok(()),
    }
}

/// Union of recurrence rules.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceSet {
    pub rules: Vec<RecurrenceRule>,
}

impl RecurrenceSet {
    pub fn new(rules: Vec<RecurrenceRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Minimum over every rule's next occurrence after `cutoff`.
    pub fn next_after(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.rules
            .iter()
            .filter_map(|rule| rule.next_after(cutoff, now))
            .min()
    }
}

impl FromIterator<RecurrenceRule> for RecurrenceSet {
    fn from_iter<T: IntoIterator<Item = RecurrenceRule>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// What one period of the sequence yields.
enum Period {
    /// Ordered occurrences of this period (possibly empty).
    Occurrences(Vec<NaiveDateTime>),
    /// Nothing can match before the given period index.
    SkipTo(i64),
}

/// A rule with its anchor resolved and its implicit constraints filled in.
struct Expansion {
    frequency: Frequency,
    interval: i64,
    anchor: NaiveDateTime,
    count: Option<u32>,
    until: Option<NaiveDateTime>,
    set_pos: Vec<i32>,
    months: Vec<u32>,
    month_days: Vec<i32>,
    year_days: Vec<i32>,
    week_numbers: Vec<i32>,
    weekdays: Vec<u32>,
    hours: Vec<u32>,
    minutes: Vec<u32>,
    second: u32,
}

impl Expansion {
    fn new(rule: &RecurrenceRule, anchor: NaiveDateTime) -> Self {
        let mut months = unsigned(&rule.by_month);
        let mut month_days = rule.by_month_day.clone();
        let mut weekdays = unsigned(&rule.by_weekday);

        let day_unconstrained = rule.by_week_no.is_empty()
            && rule.by_year_day.is_empty()
            && rule.by_month_day.is_empty()
            && rule.by_weekday.is_empty();
        if day_unconstrained {
            match rule.frequency {
                Frequency::Yearly => {
                    if months.is_empty() {
                        months = vec![anchor.month()];
                    }
                    month_days = vec![anchor.day() as i32];
                }
                Frequency::Monthly => month_days = vec![anchor.day() as i32],
                Frequency::Weekly => weekdays = vec![anchor.weekday().num_days_from_monday()],
                _ => {}
            }
        }

        let hours = if rule.by_hour.is_empty() && rule.frequency < Frequency::Hourly {
            vec![anchor.hour()]
        } else {
            unsigned(&rule.by_hour)
        };
        let minutes = if rule.by_minute.is_empty() && rule.frequency < Frequency::Minutely {
            vec![anchor.minute()]
        } else {
            unsigned(&rule.by_minute)
        };

        Self {
            frequency: rule.frequency,
            interval: i64::from(rule.interval.unwrap_or(1).max(1)),
            anchor,
            count: rule.count,
            until: rule.until.map(|u| u.naive_utc()),
            set_pos: rule.by_set_pos.clone(),
            months,
            month_days,
            year_days: rule.by_year_day.clone(),
            week_numbers: rule.by_week_no.clone(),
            weekdays,
            hours,
            minutes,
            second: anchor.second(),
        }
    }

    fn next_after(&self, cutoff: NaiveDateTime) -> Option<NaiveDateTime> {
        let horizon = (i64::from(self.anchor.year().max(cutoff.year()))
            + HORIZON_YEARS * self.interval)
            .min(i64::from(MAX_YEAR));
        let mut emitted: u32 = 0;
        // Skipping ahead is only sound when nothing has to be counted.
        let mut k = match self.count {
            None => self.first_relevant_period(cutoff),
            Some(_) => 0,
        };

        loop {
            let start = self.period_start(k)?;
            if i64::from(start.year()) > horizon {
                return None;
            }
            if let Some(until) = self.until {
                if start > until {
                    return None;
                }
            }

            match self.period(k, start) {
                Period::SkipTo(next) => k = next,
                Period::Occurrences(occurrences) => {
                    for occurrence in occurrences {
                        if occurrence < self.anchor {
                            continue;
                        }
                        if let Some(until) = self.until {
                            if occurrence > until {
                                return None;
                            }
                        }
                        if let Some(count) = self.count {
                            if emitted >= count {
                                return None;
                            }
                            emitted += 1;
                        }
                        if occurrence > cutoff {
                            return Some(occurrence);
                        }
                    }
                    k += 1;
                }
            }
        }
    }

    /// Index of a period no later than the one containing `cutoff`.
    fn first_relevant_period(&self, cutoff: NaiveDateTime) -> i64 {
        if cutoff <= self.anchor {
            return 0;
        }
        let units = match self.frequency {
            Frequency::Yearly => i64::from(cutoff.year() - self.anchor.year()),
            Frequency::Monthly => month_index(cutoff.date()) - month_index(self.anchor.date()),
            Frequency::Weekly => (cutoff.date() - self.anchor_monday()).num_days() / 7,
            Frequency::Daily => (cutoff.date() - self.anchor.date()).num_days(),
            Frequency::Hourly => (cutoff - self.anchor_hour()).num_hours(),
            Frequency::Minutely => (cutoff - self.anchor_minute()).num_minutes(),
        };
        (units / self.interval - 1).max(0)
    }

    fn anchor_monday(&self) -> NaiveDate {
        let offset = i64::from(self.anchor.weekday().num_days_from_monday());
        self.anchor.date() - Duration::days(offset)
    }

    fn anchor_hour(&self) -> NaiveDateTime {
        self.anchor.date().and_time(
            NaiveTime::from_hms_opt(self.anchor.hour(), 0, 0).unwrap_or_default(),
        )
    }

    fn anchor_minute(&self) -> NaiveDateTime {
        truncate_to_minute(self.anchor)
    }

    /// First instant covered by period `k`; `None` past the calendar's end.
    fn period_start(&self, k: i64) -> Option<NaiveDateTime> {
        let step = k.checked_mul(self.interval)?;
        match self.frequency {
            Frequency::Yearly => {
                let year = i64::from(self.anchor.year()) + step;
                if year > i64::from(MAX_YEAR) {
                    return None;
                }
                NaiveDate::from_ymd_opt(year as i32, 1, 1).map(midnight)
            }
            Frequency::Monthly => {
                let index = month_index(self.anchor.date()).checked_add(step)?;
                let year = index.div_euclid(12);
                if year > i64::from(MAX_YEAR) {
                    return None;
                }
                NaiveDate::from_ymd_opt(year as i32, index.rem_euclid(12) as u32 + 1, 1)
                    .map(midnight)
            }
            Frequency::Weekly => {
                if k == 0 {
                    return Some(midnight(self.anchor.date()));
                }
                self.anchor_monday()
                    .checked_add_signed(Duration::try_days(step.checked_mul(7)?)?)
                    .map(midnight)
            }
            Frequency::Daily => self
                .anchor
                .date()
                .checked_add_signed(Duration::try_days(step)?)
                .map(midnight),
            Frequency::Hourly => self
                .anchor_hour()
                .checked_add_signed(Duration::try_hours(step)?),
            Frequency::Minutely => self
                .anchor_minute()
                .checked_add_signed(Duration::try_minutes(step)?),
        }
    }

    fn period(&self, k: i64, start: NaiveDateTime) -> Period {
        match self.frequency {
            Frequency::Yearly | Frequency::Monthly | Frequency::Weekly | Frequency::Daily => {
                let days: Vec<NaiveDate> = self
                    .period_days(k, start.date())
                    .into_iter()
                    .filter(|day| self.day_matches(*day))
                    .collect();
                let times = self.times_of_day();
                let occurrences = days
                    .iter()
                    .flat_map(|day| times.iter().map(move |time| day.and_time(*time)))
                    .collect();
                Period::Occurrences(self.select_positions(occurrences))
            }
            Frequency::Hourly => {
                if !self.day_matches(start.date()) {
                    return Period::SkipTo(self.first_period_at(k, start, next_day(start)));
                }
                if !self.hours.is_empty() && !self.hours.contains(&start.hour()) {
                    return Period::Occurrences(Vec::new());
                }
                let occurrences = self
                    .minutes
                    .iter()
                    .filter_map(|minute| {
                        NaiveTime::from_hms_opt(start.hour(), *minute, self.second)
                            .map(|time| start.date().and_time(time))
                    })
                    .collect();
                Period::Occurrences(self.select_positions(occurrences))
            }
            Frequency::Minutely => {
                if !self.day_matches(start.date()) {
                    return Period::SkipTo(self.first_period_at(k, start, next_day(start)));
                }
                if !self.hours.is_empty() && !self.hours.contains(&start.hour()) {
                    return Period::SkipTo(self.first_period_at(k, start, next_hour(start)));
                }
                if !self.minutes.is_empty() && !self.minutes.contains(&start.minute()) {
                    return Period::Occurrences(Vec::new());
                }
                let occurrence = start + Duration::seconds(i64::from(self.second));
                Period::Occurrences(self.select_positions(vec![occurrence]))
            }
        }
    }

    /// Smallest period index after `k` whose start is at or past `boundary`.
    fn first_period_at(&self, k: i64, start: NaiveDateTime, boundary: NaiveDateTime) -> i64 {
        let gap = boundary - start;
        let units = match self.frequency {
            Frequency::Hourly => gap.num_hours(),
            _ => gap.num_minutes(),
        };
        let periods = (units + self.interval - 1) / self.interval;
        k + periods.max(1)
    }

    /// Calendar days covered by period `k` of a day-or-coarser rule.
    fn period_days(&self, k: i64, first: NaiveDate) -> Vec<NaiveDate> {
        let last = match self.frequency {
            Frequency::Yearly => NaiveDate::from_ymd_opt(first.year(), 12, 31),
            Frequency::Monthly => NaiveDate::from_ymd_opt(
                first.year(),
                first.month(),
                days_in_month(first.year(), first.month()),
            ),
            Frequency::Weekly => {
                let week_start = if k == 0 { self.anchor_monday() } else { first };
                week_start.checked_add_signed(Duration::days(6))
            }
            _ => Some(first),
        };
        let Some(last) = last else {
            return Vec::new();
        };

        let mut days = Vec::new();
        let mut day = first;
        while day <= last {
            days.push(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        days
    }

    fn times_of_day(&self) -> Vec<NaiveTime> {
        let mut times = Vec::with_capacity(self.hours.len() * self.minutes.len());
        for hour in &self.hours {
            for minute in &self.minutes {
                if let Some(time) = NaiveTime::from_hms_opt(*hour, *minute, self.second) {
                    times.push(time);
                }
            }
        }
        times
    }

    fn day_matches(&self, day: NaiveDate) -> bool {
        if !self.months.is_empty() && !self.months.contains(&day.month()) {
            return false;
        }
        if !self.week_numbers.is_empty() && !self.week_matches(day) {
            return false;
        }
        if !self.weekdays.is_empty()
            && !self.weekdays.contains(&day.weekday().num_days_from_monday())
        {
            return false;
        }
        if !self.month_days.is_empty() {
            let positive = day.day() as i32;
            let negative = positive - days_in_month(day.year(), day.month()) as i32 - 1;
            if !self.month_days.contains(&positive) && !self.month_days.contains(&negative) {
                return false;
            }
        }
        if !self.year_days.is_empty() {
            let positive = day.ordinal() as i32;
            let negative = positive - days_in_year(day.year()) as i32 - 1;
            if !self.year_days.contains(&positive) && !self.year_days.contains(&negative) {
                return false;
            }
        }
        true
    }

    /// ISO-8601 week numbering (Monday start, week 1 holds January 4th).
    fn week_matches(&self, day: NaiveDate) -> bool {
        let iso = day.iso_week();
        let week = iso.week() as i32;
        let weeks_in_year = NaiveDate::from_ymd_opt(iso.year(), 12, 28)
            .map(|d| d.iso_week().week() as i32)
            .unwrap_or(52);
        let negative = week - weeks_in_year - 1;
        self.week_numbers.contains(&week) || self.week_numbers.contains(&negative)
    }

    fn select_positions(&self, occurrences: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.set_pos.is_empty() {
            return occurrences;
        }
        let len = occurrences.len() as i64;
        let mut picked: Vec<NaiveDateTime> = self
            .set_pos
            .iter()
            .filter_map(|pos| {
                let index = if *pos > 0 {
                    i64::from(*pos) - 1
                } else {
                    len + i64::from(*pos)
                };
                (0..len)
                    .contains(&index)
                    .then(|| occurrences[index as usize])
            })
            .collect();
        picked.sort();
        picked.dedup();
        picked
    }
}

fn unsigned(values: &[i32]) -> Vec<u32> {
    let mut out: Vec<u32> = values
        .iter()
        .filter_map(|v| u32::try_from(*v).ok())
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::default())
}

fn next_day(at: NaiveDateTime) -> NaiveDateTime {
    midnight(at.date()) + Duration::days(1)
}

fn next_hour(at: NaiveDateTime) -> NaiveDateTime {
    truncate_to_minute(at) - Duration::minutes(i64::from(at.minute())) + Duration::hours(1)
}

fn truncate_to_second(at: NaiveDateTime) -> NaiveDateTime {
    at.with_nanosecond(0).unwrap_or(at)
}

fn truncate_to_minute(at: NaiveDateTime) -> NaiveDateTime {
    let at = truncate_to_second(at);
    at.with_second(0).unwrap_or(at)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(31)
}

fn days_in_year(year: i32) -> u32 {
    if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366
    } else {
        365
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn now() -> DateTime<Utc> {
        at(2014, 11, 30, 10, 0)
    }

    #[test]
    fn empty_set_has_no_next_time() {
        assert_eq!(RecurrenceSet::default().next_after(now(), now()), None);
    }

    #[test]
    fn daily_rule_fires_at_anchor_time() {
        let rule = RecurrenceRule::new(Frequency::Daily).with_start(at(2014, 11, 29, 18, 0));
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 11, 30, 18, 0)));
    }

    #[test]
    fn weekly_rule_fires_on_anchor_weekday() {
        let rule = RecurrenceRule::new(Frequency::Weekly).with_start(at(2014, 11, 29, 18, 0));
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 6, 18, 0)));
    }

    #[test]
    fn next_is_strictly_after_cutoff() {
        let rule = RecurrenceRule::new(Frequency::Daily).with_start(at(2014, 11, 29, 18, 0));
        let cutoff = at(2014, 11, 30, 18, 0);
        assert_eq!(rule.next_after(cutoff, now()), Some(at(2014, 12, 1, 18, 0)));
    }

    #[test]
    fn cutoff_before_anchor_yields_anchor() {
        let rule = RecurrenceRule::new(Frequency::Daily).with_start(at(2015, 1, 1, 9, 0));
        assert_eq!(rule.next_after(now(), now()), Some(at(2015, 1, 1, 9, 0)));
    }

    #[test]
    fn count_bounds_the_sequence() {
        let rule = RecurrenceRule::new(Frequency::Daily)
            .with_start(at(2014, 11, 29, 18, 0))
            .with_count(2);
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 11, 30, 18, 0)));
        assert_eq!(rule.next_after(at(2014, 11, 30, 19, 0), now()), None);
    }

    #[test]
    fn until_is_inclusive() {
        let rule = RecurrenceRule::new(Frequency::Daily)
            .with_start(at(2014, 11, 29, 18, 0))
            .with_until(at(2014, 11, 30, 18, 0));
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 11, 30, 18, 0)));
        assert_eq!(rule.next_after(at(2014, 11, 30, 18, 0), now()), None);
    }

    #[test]
    fn interval_spaces_periods() {
        let rule = RecurrenceRule::new(Frequency::Daily)
            .with_start(at(2014, 11, 1, 12, 0))
            .with_interval(3);
        // 1st, 4th, ..., 28th, 1st of December.
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 1, 12, 0)));
    }

    #[test]
    fn weekly_with_weekdays_and_time_constraints() {
        let rule = RecurrenceRule::new(Frequency::Weekly)
            .with_start(at(2014, 11, 29, 18, 0))
            .with_weekdays([0, 4])
            .with_hours([9])
            .with_minutes([30]);
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 1, 9, 30)));
    }

    #[test]
    fn monthly_last_day_of_month() {
        let rule = RecurrenceRule::new(Frequency::Monthly)
            .with_start(at(2014, 1, 31, 8, 0))
            .with_month_days([-1]);
        let earlier = at(2014, 11, 1, 0, 0);
        assert_eq!(rule.next_after(earlier, now()), Some(at(2014, 11, 30, 8, 0)));
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 31, 8, 0)));
    }

    #[test]
    fn monthly_default_day_skips_short_months() {
        let rule = RecurrenceRule::new(Frequency::Monthly).with_start(at(2014, 1, 31, 8, 0));
        assert_eq!(
            rule.next_after(at(2014, 2, 1, 0, 0), now()),
            Some(at(2014, 3, 31, 8, 0))
        );
    }

    #[test]
    fn yearly_leap_day_waits_for_leap_year() {
        let rule = RecurrenceRule::new(Frequency::Yearly).with_start(at(2012, 2, 29, 12, 0));
        assert_eq!(
            rule.next_after(at(2013, 1, 1, 0, 0), now()),
            Some(at(2016, 2, 29, 12, 0))
        );
    }

    #[test]
    fn yearly_last_year_day() {
        let rule = RecurrenceRule::new(Frequency::Yearly)
            .with_start(at(2014, 1, 1, 0, 0))
            .with_year_days([-1]);
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 31, 0, 0)));
    }

    #[test]
    fn yearly_week_number_uses_iso_weeks() {
        let rule = RecurrenceRule::new(Frequency::Yearly)
            .with_start(at(2014, 1, 1, 0, 0))
            .with_week_numbers([1])
            .with_weekdays([0]);
        // Monday of ISO week 1 of 2015 falls on 2014-12-29.
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 29, 0, 0)));
    }

    #[test]
    fn set_position_picks_last_weekday_of_month() {
        let rule = RecurrenceRule::new(Frequency::Monthly)
            .with_start(at(2014, 11, 1, 12, 0))
            .with_weekdays([0, 1, 2, 3, 4])
            .with_set_positions([-1]);
        assert_eq!(
            rule.next_after(at(2014, 11, 1, 0, 0), now()),
            Some(at(2014, 11, 28, 12, 0))
        );
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 31, 12, 0)));
    }

    #[test]
    fn hourly_rule_with_minutes() {
        let rule = RecurrenceRule::new(Frequency::Hourly)
            .with_start(at(2014, 11, 29, 18, 10))
            .with_minutes([0, 30]);
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 11, 30, 10, 30)));
    }

    #[test]
    fn minutely_rule_skips_to_allowed_hour() {
        let rule = RecurrenceRule::new(Frequency::Minutely)
            .with_start(at(2014, 11, 29, 18, 0))
            .with_interval(15)
            .with_hours([9]);
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 1, 9, 0)));
    }

    #[test]
    fn minutely_rule_respects_weekday_filter() {
        let rule = RecurrenceRule::new(Frequency::Minutely)
            .with_start(at(2014, 11, 29, 18, 0))
            .with_interval(30)
            .with_weekdays([2]);
        // Next Wednesday after Sunday 2014-11-30 is 2014-12-03.
        assert_eq!(rule.next_after(now(), now()), Some(at(2014, 12, 3, 0, 0)));
    }

    #[test]
    fn unanchored_rule_uses_now_truncated_to_minute() {
        let rule = RecurrenceRule::new(Frequency::Daily);
        let now = Utc.with_ymd_and_hms(2014, 11, 30, 10, 0, 30).unwrap();
        assert_eq!(rule.next_after(now, now), Some(at(2014, 12, 1, 10, 0)));
    }

    #[test]
    fn impossible_constraints_are_exhausted() {
        let rule = RecurrenceRule::new(Frequency::Yearly)
            .with_start(at(2014, 1, 1, 0, 0))
            .with_months([2])
            .with_month_days([30]);
        assert_eq!(rule.next_after(now(), now()), None);
    }

    #[test]
    fn set_returns_minimum_across_rules() {
        let daily = RecurrenceRule::new(Frequency::Daily).with_start(at(2014, 11, 29, 18, 0));
        let hourly = RecurrenceRule::new(Frequency::Hourly).with_start(at(2014, 11, 29, 18, 45));
        let exhausted = RecurrenceRule::new(Frequency::Daily)
            .with_start(at(2014, 1, 1, 0, 0))
            .with_count(1);
        let set: RecurrenceSet = vec![daily.clone(), exhausted.clone(), hourly.clone()]
            .into_iter()
            .collect();

        let expected = [&daily, &exhausted, &hourly]
            .iter()
            .filter_map(|r| r.next_after(now(), now()))
            .min();
        assert_eq!(set.next_after(now(), now()), expected);
        assert_eq!(set.next_after(now(), now()), Some(at(2014, 11, 30, 10, 45)));
    }

    #[test]
    fn fully_exhausted_set_yields_none() {
        let set = RecurrenceSet::new(vec![RecurrenceRule::new(Frequency::Daily)
            .with_start(at(2014, 1, 1, 0, 0))
            .with_until(at(2014, 2, 1, 0, 0))]);
        assert_eq!(set.next_after(now(), now()), None);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(RecurrenceRule::new(Frequency::Daily)
            .with_hours([24])
            .validate()
            .is_err());
        assert!(RecurrenceRule::new(Frequency::Monthly)
            .with_month_days([0])
            .validate()
            .is_err());
        assert!(RecurrenceRule::new(Frequency::Daily)
            .with_interval(0)
            .validate()
            .is_err());
        assert!(RecurrenceRule::new(Frequency::Weekly)
            .with_weekdays([0, 6])
            .with_month_days([-31])
            .validate()
            .is_ok());
    }

    #[test]
    fn rules_round_trip_through_json() {
        let rule = RecurrenceRule::new(Frequency::Weekly)
            .with_start(at(2014, 11, 29, 18, 0))
            .with_weekdays([5]);
        let json = serde_json::to_string(&rule).unwrap();
        let back: RecurrenceRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
