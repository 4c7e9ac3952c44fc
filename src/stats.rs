use chrono::NaiveDate;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct MarkRecord {
    pub student_id: String,
    pub date: NaiveDate,
    pub class_time_num: i64,
    pub class_name: String,
    pub subject_name: String,
    pub teacher_name: String,
    pub is_present: bool,
    pub is_absent: bool,
    pub is_late: bool,
    pub is_excused: bool,
    pub excuse_note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendanceStats {
    pub total_records: i64,
    pub absent_count: i64,
    pub late_count: i64,
    pub excused_count: i64,
    pub attendance_rate: i64,
}

/// Flags are counted independently; a mark may be both late and absent and
/// then contributes to both counters.
pub fn statistics(marks: &[MarkRecord]) -> AttendanceStats {
    let total_records = marks.len() as i64;
    let absent_count = marks.iter().filter(|m| m.is_absent).count() as i64;
    let late_count = marks.iter().filter(|m| m.is_late).count() as i64;
    let excused_count = marks.iter().filter(|m| m.is_excused).count() as i64;

    // rate = round(100 * (total - absent) / total), 0 with no records.
    let attendance_rate = if total_records > 0 {
        (100.0 * (total_records - absent_count) as f64 / total_records as f64).round() as i64
    } else {
        0
    };

    AttendanceStats {
        total_records,
        absent_count,
        late_count,
        excused_count,
        attendance_rate,
    }
}

/// Marks grouped by session date, newest date first; within a date, sessions
/// run in ascending period order (class name as the final tie).
pub fn group_by_date(marks: &[MarkRecord]) -> Vec<(NaiveDate, Vec<&MarkRecord>)> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&MarkRecord>> = BTreeMap::new();
    for m in marks {
        by_date.entry(m.date).or_default().push(m);
    }

    let mut groups: Vec<(NaiveDate, Vec<&MarkRecord>)> = by_date.into_iter().collect();
    groups.reverse();
    for (_, sessions) in groups.iter_mut() {
        sessions.sort_by(|a, b| {
            a.class_time_num
                .cmp(&b.class_time_num)
                .then_with(|| a.class_name.cmp(&b.class_name))
        });
    }
    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassDaySummary {
    pub total_students: i64,
    pub present_count: i64,
    pub absent_count: i64,
    pub late_count: i64,
    pub excused_count: i64,
}

/// Present is always derived as total - (absent + excused); a separately
/// reported present counter can be stale and is never trusted.
pub fn summarize_class_day(total_students: i64, marks: &[&MarkRecord]) -> ClassDaySummary {
    let absent_count = marks.iter().filter(|m| m.is_absent).count() as i64;
    let late_count = marks.iter().filter(|m| m.is_late).count() as i64;
    let excused_count = marks.iter().filter(|m| m.is_excused).count() as i64;
    ClassDaySummary {
        total_students,
        present_count: total_students - (absent_count + excused_count),
        absent_count,
        late_count,
        excused_count,
    }
}
