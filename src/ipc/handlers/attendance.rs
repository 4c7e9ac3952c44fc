use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_bool, get_required_i64, get_required_str, parse_date,
    require_student, HandlerErr, DATE_FMT,
};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, MarkRecord};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn mark_json(m: &MarkRecord) -> serde_json::Value {
    json!({
        "student_id": m.student_id,
        "class_time_num": m.class_time_num,
        "class_name": m.class_name,
        "subject_name": m.subject_name,
        "teacher_name": m.teacher_name,
        "is_present": m.is_present,
        "is_absent": m.is_absent,
        "is_late": m.is_late,
        "is_excused": m.is_excused,
        "excuse_note": m.excuse_note,
        "date": m.date.format(DATE_FMT).to_string()
    })
}

fn row_to_mark(r: &rusqlite::Row) -> rusqlite::Result<(String, i64, String, String, String, i64, i64, i64, i64, Option<String>, String)> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
        r.get(10)?,
    ))
}

const MARK_COLUMNS: &str = "student_id, class_time_num, class_name, subject_name, teacher_name,
    is_present, is_absent, is_late, is_excused, excuse_note, date";

fn collect_marks(rows: Vec<(String, i64, String, String, String, i64, i64, i64, i64, Option<String>, String)>) -> Result<Vec<MarkRecord>, HandlerErr> {
    let mut marks = Vec::with_capacity(rows.len());
    for (student_id, class_time_num, class_name, subject_name, teacher_name, present, absent, late, excused, excuse_note, date_raw) in rows {
        let date = parse_date(&date_raw, "date")?;
        marks.push(MarkRecord {
            student_id,
            date,
            class_time_num,
            class_name,
            subject_name,
            teacher_name,
            is_present: present != 0,
            is_absent: absent != 0,
            is_late: late != 0,
            is_excused: excused != 0,
            excuse_note,
        });
    }
    Ok(marks)
}

fn marks_for_student(conn: &Connection, student_id: &str) -> Result<Vec<MarkRecord>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM attendance_marks WHERE student_id = ?",
        MARK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([student_id], |r| row_to_mark(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    collect_marks(rows)
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "student_id")?;
    let date_raw = get_required_str(params, "date")?;
    let class_time_num = get_required_i64(params, "class_time_num")?;
    let class_name = get_required_str(params, "class_name")?;
    let subject_name = get_required_str(params, "subject_name")?;
    let teacher_name = get_required_str(params, "teacher_name")?;
    let is_present = get_required_bool(params, "is_present")?;
    let is_absent = get_required_bool(params, "is_absent")?;
    let is_late = get_required_bool(params, "is_late")?;
    let is_excused = get_required_bool(params, "is_excused")?;
    let excuse_note = get_optional_str(params, "excuse_note")?;

    let date = parse_date(&date_raw, "date")?.format(DATE_FMT).to_string();
    require_student(conn, &student_id)?;

    // Exactly one mark per (student, class session). The flags themselves are
    // stored as submitted; overlapping combinations are source data, not ours
    // to normalize.
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance_marks
             WHERE student_id = ? AND date = ? AND class_name = ? AND class_time_num = ?",
            (&student_id, &date, &class_name, class_time_num),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(id) = existing {
        return Err(HandlerErr::with_details(
            "conflict",
            "mark already recorded for this class session",
            json!({ "id": id }),
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_marks(
            id, student_id, date, class_time_num, class_name, subject_name, teacher_name,
            is_present, is_absent, is_late, is_excused, excuse_note)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &date,
            class_time_num,
            &class_name,
            &subject_name,
            &teacher_name,
            is_present as i64,
            is_absent as i64,
            is_late as i64,
            is_excused as i64,
            &excuse_note,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "id": id }))
}

fn attendance_statistics(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;

    let marks = marks_for_student(conn, &student_id)?;
    let s = stats::statistics(&marks);

    let behavior_note: Option<String> = conn
        .query_row(
            "SELECT note FROM behavior_notes WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;

    let mut result = json!({
        "total_records": s.total_records,
        "absent_count": s.absent_count,
        "late_count": s.late_count,
        "excused_count": s.excused_count,
        "attendance_rate": s.attendance_rate
    });
    if let Some(note) = behavior_note {
        result["behavior_note"] = json!(note);
    }
    Ok(result)
}

fn attendance_history(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;

    let marks = marks_for_student(conn, &student_id)?;
    let groups: Vec<serde_json::Value> = stats::group_by_date(&marks)
        .into_iter()
        .map(|(date, sessions)| {
            json!({
                "date": date.format(DATE_FMT).to_string(),
                "sessions": sessions.iter().map(|m| mark_json(m)).collect::<Vec<_>>()
            })
        })
        .collect();
    Ok(json!({ "groups": groups }))
}

fn attendance_class_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date_raw = get_required_str(params, "date")?;
    let date = parse_date(&date_raw, "date")?.format(DATE_FMT).to_string();

    let mut class_stmt = conn
        .prepare("SELECT id, name FROM classes ORDER BY name")
        .map_err(HandlerErr::db)?;
    let classes = class_stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let sql = format!(
        "SELECT {} FROM attendance_marks WHERE date = ? AND class_name = ?",
        MARK_COLUMNS
    );
    let mut mark_stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;

    let mut out = Vec::with_capacity(classes.len());
    for (class_id, class_name) in classes {
        let total_students: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM students WHERE class_id = ? AND active = 1",
                [&class_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::db)?;

        let rows = mark_stmt
            .query_map((&date, &class_name), |r| row_to_mark(r))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;
        let marks = collect_marks(rows)?;
        let refs: Vec<&MarkRecord> = marks.iter().collect();
        let summary = stats::summarize_class_day(total_students, &refs);

        out.push(json!({
            "class_name": class_name,
            "total_students": summary.total_students,
            "present_count": summary.present_count,
            "absent_count": summary.absent_count,
            "late_count": summary.late_count,
            "excused_count": summary.excused_count
        }));
    }

    Ok(json!({ "date": date, "classes": out }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "attendance.record" => attendance_record(conn, &req.params),
        "attendance.statistics" => attendance_statistics(conn, &req.params),
        "attendance.history" => attendance_history(conn, &req.params),
        "attendance.classSummary" => attendance_class_summary(conn, &req.params),
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
        "attendance.record" | "attendance.statistics" | "attendance.history"
        | "attendance.classSummary" => Some(dispatch(state, req)),
        _ => None,
    }
}
