use chrono::{Datelike, Duration, NaiveDate};

#[derive(Debug, Clone, PartialEq)]
pub struct SlotEntry {
    pub day_id: i64,
    pub period_id: i64,
    pub class_name: String,
    pub subject_name: String,
    pub teacher_id: String,
    pub classroom_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub id: i64,
    pub teacher_id: String,
    pub period_id: i64,
    pub day_id: Option<i64>,
    pub assignment_date: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub class_name: String,
    pub subject_name: String,
}

impl Substitution {
    fn is_dateless(&self) -> bool {
        self.assignment_date.is_none() && self.start_date.is_none() && self.end_date.is_none()
    }

    fn day_matches(&self, day_id: i64) -> bool {
        self.day_id.map_or(true, |d| d == day_id)
    }

    fn range_contains(&self, date: NaiveDate) -> bool {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => start <= date && date <= end,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleCell<'a> {
    Empty,
    Regular(&'a SlotEntry),
    Substituted(&'a Substitution),
    Both(&'a SlotEntry, &'a Substitution),
}

/// Concrete calendar date of `day_id` within the week containing `anchor`.
/// The offset runs from the anchor's own weekday, not the start of week:
/// target = anchor + (day_id - anchor_weekday).
pub fn date_for_day(anchor: NaiveDate, day_id: i64) -> NaiveDate {
    let anchor_idx = anchor.weekday().num_days_from_monday() as i64;
    anchor + Duration::days(day_id - anchor_idx)
}

/// Substitutions matching one (day, period) cell, in priority order:
/// a date-anchored cell takes exact `assignment_date` matches first, then
/// ranged overrides covering the date; date-less legacy rows only apply when
/// no anchor exists at all, so stale overrides cannot resurface.
pub fn matching_substitutions<'a>(
    subs: &'a [Substitution],
    day_id: i64,
    period_id: i64,
    date: Option<NaiveDate>,
) -> Vec<&'a Substitution> {
    match date {
        Some(d) => {
            let dated: Vec<&Substitution> = subs
                .iter()
                .filter(|s| s.period_id == period_id && s.assignment_date == Some(d))
                .collect();
            if !dated.is_empty() {
                return dated;
            }
            subs.iter()
                .filter(|s| {
                    s.assignment_date.is_none()
                        && s.period_id == period_id
                        && s.day_matches(day_id)
                        && s.range_contains(d)
                })
                .collect()
        }
        None => subs
            .iter()
            .filter(|s| {
                s.is_dateless() && s.period_id == period_id && s.day_id == Some(day_id)
            })
            .collect(),
    }
}

/// Collapse one cell's regular entry and matched substitutions into the
/// tagged variant. More than one match is a data-integrity condition the
/// caller can audit separately; the pick here is deterministic (lowest id).
pub fn resolve_cell<'a>(
    regular: Option<&'a SlotEntry>,
    matched: &[&'a Substitution],
) -> ScheduleCell<'a> {
    let substitution = matched.iter().min_by_key(|s| s.id).copied();
    match (regular, substitution) {
        (None, None) => ScheduleCell::Empty,
        (Some(entry), None) => ScheduleCell::Regular(entry),
        (None, Some(sub)) => ScheduleCell::Substituted(sub),
        (Some(entry), Some(sub)) => ScheduleCell::Both(entry, sub),
    }
}
