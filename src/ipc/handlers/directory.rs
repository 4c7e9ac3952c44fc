use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_student, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(HandlerErr::new("validation_error", "class name is empty"));
    }

    let existing: Option<String> = conn
        .query_row("SELECT id FROM classes WHERE name = ?", [trimmed], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(id) = existing {
        return Err(HandlerErr::with_details(
            "conflict",
            "class name already exists",
            json!({ "classId": id }),
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&id, trimmed),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "classId": id }))
}

fn classes_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM classes ORDER BY name")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "classes": rows }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let active = params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let class_exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !class_exists {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &class_id,
            last_name.trim(),
            first_name.trim(),
            active as i64,
            next_sort,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "studentId": id }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = params.get("classId").and_then(|v| v.as_str());
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.active, s.sort_order, c.name
             FROM students s JOIN classes c ON c.id = s.class_id
             WHERE (?1 IS NULL OR s.class_id = ?1)
             ORDER BY c.name, s.sort_order",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "fullName": format!("{}, {}", last, first),
                "active": r.get::<_, i64>(3)? != 0,
                "sortOrder": r.get::<_, i64>(4)?,
                "className": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "students": rows }))
}

fn buses_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let id = Uuid::new_v4().to_string();
    conn.execute("INSERT INTO buses(id, name) VALUES(?, ?)", (&id, name.trim()))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "busId": id }))
}

fn buses_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM buses ORDER BY name")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "busId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "buses": rows }))
}

fn notes_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let note = get_required_str(params, "note")?;
    require_student(conn, &student_id)?;

    conn.execute(
        "INSERT INTO behavior_notes(id, student_id, note)
         VALUES(?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET note = excluded.note",
        (Uuid::new_v4().to_string(), &student_id, note.trim()),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn notes_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let note: Option<String> = conn
        .query_row(
            "SELECT note FROM behavior_notes WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    Ok(json!({ "note": note }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "classes.create" => classes_create(conn, &req.params),
        "classes.list" => classes_list(conn),
        "students.create" => students_create(conn, &req.params),
        "students.list" => students_list(conn, &req.params),
        "buses.create" => buses_create(conn, &req.params),
        "buses.list" => buses_list(conn),
        "notes.set" => notes_set(conn, &req.params),
        "notes.get" => notes_get(conn, &req.params),
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
        "classes.create" | "classes.list" | "students.create" | "students.list"
        | "buses.create" | "buses.list" | "notes.set" | "notes.get" => {
            Some(dispatch(state, req))
        }
        _ => None,
    }
}
