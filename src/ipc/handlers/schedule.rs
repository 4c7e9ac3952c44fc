use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_i64, get_optional_str, get_required_i64, get_required_str, parse_date,
    HandlerErr, DATE_FMT,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, ScheduleCell, SlotEntry, Substitution};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

struct DayRow {
    id: i64,
    name: String,
    short: String,
}

struct PeriodRow {
    id: i64,
    number: i64,
    start_time: String,
    end_time: String,
}

enum Selector {
    Teacher(String),
    Class(String),
}

fn parse_selector(params: &serde_json::Value) -> Result<Selector, HandlerErr> {
    let teacher = get_optional_str(params, "teacherId")?;
    let class = get_optional_str(params, "className")?;
    match (teacher, class) {
        (Some(t), None) => Ok(Selector::Teacher(t)),
        (None, Some(c)) => Ok(Selector::Class(c)),
        _ => Err(HandlerErr::new(
            "bad_params",
            "exactly one of teacherId or className is required",
        )),
    }
}

fn schedule_set_days(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(days) = params.get("days").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing days"));
    };

    let mut rows = Vec::with_capacity(days.len());
    for d in days {
        let id = get_required_i64(d, "id")?;
        if !(0..=6).contains(&id) {
            return Err(HandlerErr::new(
                "validation_error",
                format!("day id must be a Monday-based index 0..6, got {}", id),
            ));
        }
        rows.push((id, get_required_str(d, "name")?, get_required_str(d, "short")?));
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM days", [])
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    for (id, name, short) in rows {
        tx.execute(
            "INSERT INTO days(id, name, short) VALUES(?, ?, ?)",
            (id, &name, &short),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn schedule_set_periods(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(periods) = params.get("periods").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing periods"));
    };

    let mut rows = Vec::with_capacity(periods.len());
    for p in periods {
        rows.push((
            get_required_i64(p, "id")?,
            get_required_i64(p, "number")?,
            get_required_str(p, "startTime")?,
            get_required_str(p, "endTime")?,
        ));
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM periods", [])
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    for (id, number, start_time, end_time) in rows {
        tx.execute(
            "INSERT INTO periods(id, number, start_time, end_time) VALUES(?, ?, ?, ?)",
            (id, number, &start_time, &end_time),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn timetable_replace(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };

    let mut rows = Vec::with_capacity(entries.len());
    for e in entries {
        let day_id = get_required_i64(e, "dayId")?;
        if !(0..=6).contains(&day_id) {
            return Err(HandlerErr::new(
                "validation_error",
                format!("dayId must be a Monday-based index 0..6, got {}", day_id),
            ));
        }
        rows.push((
            day_id,
            get_required_i64(e, "period")?,
            get_required_str(e, "className")?,
            get_required_str(e, "subjectName")?,
            get_required_str(e, "teacherId")?,
            get_optional_str(e, "classroomName")?,
        ));
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM timetable_entries", [])
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    for (day_id, period_id, class_name, subject_name, teacher_id, classroom_name) in rows {
        tx.execute(
            "INSERT INTO timetable_entries(
                id, day_id, period_id, class_name, subject_name, teacher_id, classroom_name)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                day_id,
                period_id,
                &class_name,
                &subject_name,
                &teacher_id,
                &classroom_name,
            ),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "count": entries.len() }))
}

fn substitutions_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacher_id")?;
    let period_id = get_required_i64(params, "period_xml_id")?;
    let day_id = get_optional_i64(params, "day_xml_id")?;
    let class_name = get_required_str(params, "class_name")?;
    let subject_name = get_required_str(params, "subject_name")?;

    if let Some(d) = day_id {
        if !(0..=6).contains(&d) {
            return Err(HandlerErr::new(
                "validation_error",
                format!("day_xml_id must be a Monday-based index 0..6, got {}", d),
            ));
        }
    }

    let assignment_date = get_optional_str(params, "assignment_date")?
        .map(|s| parse_date(&s, "assignment_date"))
        .transpose()?;
    let start_date = get_optional_str(params, "substitution_start_date")?
        .map(|s| parse_date(&s, "substitution_start_date"))
        .transpose()?;
    let end_date = get_optional_str(params, "substitution_end_date")?
        .map(|s| parse_date(&s, "substitution_end_date"))
        .transpose()?;
    if start_date.is_some() != end_date.is_some() {
        return Err(HandlerErr::new(
            "validation_error",
            "substitution_start_date and substitution_end_date must be given together",
        ));
    }
    if let (Some(start), Some(end)) = (start_date, end_date) {
        if end < start {
            return Err(HandlerErr::new(
                "validation_error",
                "substitution_end_date is before substitution_start_date",
            ));
        }
    }

    conn.execute(
        "INSERT INTO substitutions(
            teacher_id, period_id, day_id, assignment_date, start_date, end_date,
            class_name, subject_name)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            period_id,
            day_id,
            assignment_date.map(|d| d.format(DATE_FMT).to_string()),
            start_date.map(|d| d.format(DATE_FMT).to_string()),
            end_date.map(|d| d.format(DATE_FMT).to_string()),
            &class_name,
            &subject_name,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    let id = conn.last_insert_rowid();
    Ok(json!({ "id": id }))
}

fn load_days(conn: &Connection) -> Result<Vec<DayRow>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, short FROM days ORDER BY id")
        .map_err(HandlerErr::db)?;
    stmt.query_map([], |r| {
        Ok(DayRow {
            id: r.get(0)?,
            name: r.get(1)?,
            short: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn load_periods(conn: &Connection) -> Result<Vec<PeriodRow>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, number, start_time, end_time FROM periods ORDER BY number")
        .map_err(HandlerErr::db)?;
    stmt.query_map([], |r| {
        Ok(PeriodRow {
            id: r.get(0)?,
            number: r.get(1)?,
            start_time: r.get(2)?,
            end_time: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn load_entries(conn: &Connection, selector: &Selector) -> Result<Vec<SlotEntry>, HandlerErr> {
    let (sql, arg) = match selector {
        Selector::Teacher(t) => (
            "SELECT day_id, period_id, class_name, subject_name, teacher_id, classroom_name
             FROM timetable_entries WHERE teacher_id = ?",
            t,
        ),
        Selector::Class(c) => (
            "SELECT day_id, period_id, class_name, subject_name, teacher_id, classroom_name
             FROM timetable_entries WHERE class_name = ?",
            c,
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db)?;
    stmt.query_map([arg], |r| {
        Ok(SlotEntry {
            day_id: r.get(0)?,
            period_id: r.get(1)?,
            class_name: r.get(2)?,
            subject_name: r.get(3)?,
            teacher_id: r.get(4)?,
            classroom_name: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn load_substitutions(
    conn: &Connection,
    selector: &Selector,
) -> Result<Vec<Substitution>, HandlerErr> {
    let (sql, arg) = match selector {
        Selector::Teacher(t) => (
            "SELECT id, teacher_id, period_id, day_id, assignment_date, start_date, end_date,
                    class_name, subject_name
             FROM substitutions WHERE teacher_id = ?",
            t,
        ),
        Selector::Class(c) => (
            "SELECT id, teacher_id, period_id, day_id, assignment_date, start_date, end_date,
                    class_name, subject_name
             FROM substitutions WHERE class_name = ?",
            c,
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([arg], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, Option<i64>>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut subs = Vec::with_capacity(rows.len());
    for (id, teacher_id, period_id, day_id, assignment, start, end, class_name, subject_name) in
        rows
    {
        subs.push(Substitution {
            id,
            teacher_id,
            period_id,
            day_id,
            assignment_date: assignment
                .map(|s| parse_date(&s, "assignment_date"))
                .transpose()?,
            start_date: start.map(|s| parse_date(&s, "start_date")).transpose()?,
            end_date: end.map(|s| parse_date(&s, "end_date")).transpose()?,
            class_name,
            subject_name,
        });
    }
    Ok(subs)
}

fn entry_json(e: &SlotEntry) -> serde_json::Value {
    json!({
        "dayId": e.day_id,
        "period": e.period_id,
        "className": e.class_name,
        "subjectName": e.subject_name,
        "teacherId": e.teacher_id,
        "classroomName": e.classroom_name
    })
}

fn substitution_json(s: &Substitution) -> serde_json::Value {
    json!({
        "id": s.id,
        "teacher_id": s.teacher_id,
        "period_xml_id": s.period_id,
        "day_xml_id": s.day_id,
        "assignment_date": s.assignment_date.map(|d| d.format(DATE_FMT).to_string()),
        "substitution_start_date": s.start_date.map(|d| d.format(DATE_FMT).to_string()),
        "substitution_end_date": s.end_date.map(|d| d.format(DATE_FMT).to_string()),
        "class_name": s.class_name,
        "subject_name": s.subject_name
    })
}

fn schedule_effective(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let selector = parse_selector(params)?;
    let anchor: Option<NaiveDate> = get_optional_str(params, "weekAnchorDate")?
        .map(|s| parse_date(&s, "weekAnchorDate"))
        .transpose()?;

    let days = load_days(conn)?;
    let periods = load_periods(conn)?;
    let entries = load_entries(conn, &selector)?;
    let subs = load_substitutions(conn, &selector)?;

    let mut cells = Vec::new();
    for day in &days {
        let date = anchor.map(|a| schedule::date_for_day(a, day.id));
        for period in &periods {
            let mut regulars: Vec<&SlotEntry> = entries
                .iter()
                .filter(|e| e.day_id == day.id && e.period_id == period.id)
                .collect();
            regulars.sort_by(|a, b| a.class_name.cmp(&b.class_name));
            let regular = regulars.first().copied();

            let matched = schedule::matching_substitutions(&subs, day.id, period.id, date);
            let cell = schedule::resolve_cell(regular, &matched);

            let (kind, regular_json, sub_json) = match cell {
                ScheduleCell::Empty => continue,
                ScheduleCell::Regular(e) => ("regular", Some(entry_json(e)), None),
                ScheduleCell::Substituted(s) => ("substituted", None, Some(substitution_json(s))),
                ScheduleCell::Both(e, s) => {
                    ("both", Some(entry_json(e)), Some(substitution_json(s)))
                }
            };
            cells.push(json!({
                "dayId": day.id,
                "date": date.map(|d| d.format(DATE_FMT).to_string()),
                "period": period.id,
                "kind": kind,
                "regular": regular_json,
                "substitution": sub_json
            }));
        }
    }

    let days_json: Vec<serde_json::Value> = days
        .iter()
        .map(|d| json!({ "id": d.id, "name": d.name, "short": d.short }))
        .collect();
    let periods_json: Vec<serde_json::Value> = periods
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "number": p.number,
                "startTime": p.start_time,
                "endTime": p.end_time
            })
        })
        .collect();

    Ok(json!({
        "days": days_json,
        "periods": periods_json,
        "cells": cells
    }))
}

fn schedule_audit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let selector = parse_selector(params)?;
    let anchor_raw = get_required_str(params, "weekAnchorDate")?;
    let anchor = parse_date(&anchor_raw, "weekAnchorDate")?;

    let days = load_days(conn)?;
    let periods = load_periods(conn)?;
    let subs = load_substitutions(conn, &selector)?;

    let mut cells_checked = 0usize;
    let mut ambiguous = Vec::new();
    for day in &days {
        let date = schedule::date_for_day(anchor, day.id);
        for period in &periods {
            cells_checked += 1;
            let matched = schedule::matching_substitutions(&subs, day.id, period.id, Some(date));
            if matched.len() > 1 {
                let mut ids: Vec<i64> = matched.iter().map(|s| s.id).collect();
                ids.sort_unstable();
                ambiguous.push(json!({
                    "dayId": day.id,
                    "period": period.id,
                    "date": date.format(DATE_FMT).to_string(),
                    "substitutionIds": ids
                }));
            }
        }
    }

    if !ambiguous.is_empty() {
        return Err(HandlerErr::with_details(
            "data_integrity",
            "multiple substitutions match a single schedule cell",
            json!({ "ambiguous": ambiguous }),
        ));
    }
    Ok(json!({ "cellsChecked": cells_checked, "ambiguous": [] }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "schedule.setDays" => schedule_set_days(conn, &req.params),
        "schedule.setPeriods" => schedule_set_periods(conn, &req.params),
        "timetable.replace" => timetable_replace(conn, &req.params),
        "substitutions.record" => substitutions_record(conn, &req.params),
        "schedule.effective" => schedule_effective(conn, &req.params),
        "schedule.audit" => schedule_audit(conn, &req.params),
        other => Err(HandlerErr::new(
            "not_implemented",
            format!("unknown method: {}", other),
        )),
    };
    match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schedule.setDays" | "schedule.setPeriods" | "timetable.replace"
        | "substitutions.record" | "schedule.effective" | "schedule.audit" => {
            Some(dispatch(state, req))
        }
        _ => None,
    }
}
