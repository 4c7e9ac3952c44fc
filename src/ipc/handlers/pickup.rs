use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, parse_date, parse_datetime, require_student, HandlerErr,
    DATETIME_FMT, DATE_FMT,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUS_PENDING: &str = "pending";
const STATUS_CONFIRMED: &str = "confirmed";

const DAILY_COMPLETED_LIMIT: i64 = 3;

fn resolve_now(params: &serde_json::Value) -> Result<NaiveDateTime, HandlerErr> {
    match get_optional_str(params, "now")? {
        Some(raw) => parse_datetime(&raw, "now"),
        None => Ok(chrono::Local::now().naive_local()),
    }
}

fn next_version(conn: &Connection) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM pickup_requests",
        [],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}

struct RequestRow {
    id: String,
    student_id: String,
    status: String,
    request_time: String,
    confirmation_time: Option<String>,
    completion_time: Option<String>,
    version: i64,
}

fn request_json(r: &RequestRow) -> serde_json::Value {
    json!({
        "id": r.id,
        "student_id": r.student_id,
        "status": r.status,
        "request_time": r.request_time,
        "confirmation_time": r.confirmation_time,
        "completion_time": r.completion_time,
        "version": r.version
    })
}

fn load_request(conn: &Connection, request_id: &str) -> Result<Option<RequestRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, status, request_time, confirmation_time, completion_time, version
         FROM pickup_requests WHERE id = ?",
        [request_id],
        |r| {
            Ok(RequestRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                status: r.get(2)?,
                request_time: r.get(3)?,
                confirmation_time: r.get(4)?,
                completion_time: r.get(5)?,
                version: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn completed_count(conn: &Connection, student_id: &str, day: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT completed_count FROM pickup_quota WHERE student_id = ? AND day = ?",
        (student_id, day),
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db)
    .map(|v| v.unwrap_or(0))
}

fn pickup_request(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let now = resolve_now(params)?;
    require_student(conn, &student_id)?;

    let day = now.date().format(DATE_FMT).to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // At most one pending/confirmed request per student.
    let active: Option<String> = tx
        .query_row(
            "SELECT id FROM pickup_requests
             WHERE student_id = ? AND status IN (?, ?)",
            (&student_id, STATUS_PENDING, STATUS_CONFIRMED),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(id) = active {
        return Err(HandlerErr::with_details(
            "conflict",
            "an active pickup request already exists for this student",
            json!({ "id": id }),
        ));
    }

    if completed_count(&tx, &student_id, &day)? >= DAILY_COMPLETED_LIMIT {
        return Err(HandlerErr::with_details(
            "quota_exceeded",
            "daily completed pickup limit reached",
            json!({ "limit": DAILY_COMPLETED_LIMIT, "day": day }),
        ));
    }

    // The quota counter row is born at the first request of the day.
    tx.execute(
        "INSERT INTO pickup_quota(student_id, day, completed_count)
         VALUES(?, ?, 0)
         ON CONFLICT(student_id, day) DO NOTHING",
        (&student_id, &day),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let version = next_version(&tx)?;
    let row = RequestRow {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.clone(),
        status: STATUS_PENDING.to_string(),
        request_time: now.format(DATETIME_FMT).to_string(),
        confirmation_time: None,
        completion_time: None,
        version,
    };
    tx.execute(
        "INSERT INTO pickup_requests(
            id, student_id, status, request_time, confirmation_time, completion_time, version)
         VALUES(?, ?, ?, ?, NULL, NULL, ?)",
        (&row.id, &row.student_id, &row.status, &row.request_time, version),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(request_json(&row))
}

/// Shared check-and-set: the UPDATE only lands when the row is still in one
/// of `from`, so two racing transitions cannot both succeed.
fn transition(
    conn: &Connection,
    request_id: &str,
    from: &[&str],
    apply: &str,
    apply_params: &[&dyn rusqlite::ToSql],
) -> Result<RequestRow, HandlerErr> {
    let changed = conn
        .execute(apply, apply_params)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        let Some(row) = load_request(conn, request_id)? else {
            return Err(HandlerErr::new("not_found", "pickup request not found"));
        };
        return Err(HandlerErr::with_details(
            "invalid_state",
            format!(
                "transition requires status in {:?}, request is '{}'",
                from, row.status
            ),
            json!({ "status": row.status }),
        ));
    }
    load_request(conn, request_id)?
        .ok_or_else(|| HandlerErr::new("db_query_failed", "updated request row vanished"))
}

fn pickup_confirm(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let request_id = get_required_str(params, "requestId")?;
    let now = resolve_now(params)?;
    let now_text = now.format(DATETIME_FMT).to_string();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let version = next_version(&tx)?;
    let row = transition(
        &tx,
        &request_id,
        &[STATUS_PENDING],
        "UPDATE pickup_requests
         SET status = 'confirmed', confirmation_time = ?, version = ?
         WHERE id = ? AND status = 'pending'",
        rusqlite::params![now_text, version, request_id],
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(request_json(&row))
}

fn pickup_complete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let request_id = get_required_str(params, "requestId")?;
    let now = resolve_now(params)?;
    let now_text = now.format(DATETIME_FMT).to_string();
    let day = now.date().format(DATE_FMT).to_string();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let version = next_version(&tx)?;
    let row = transition(
        &tx,
        &request_id,
        &[STATUS_CONFIRMED],
        "UPDATE pickup_requests
         SET status = 'completed', completion_time = ?, version = ?
         WHERE id = ? AND status = 'confirmed'",
        rusqlite::params![now_text, version, request_id],
    )?;

    // The daily cap counts completions, so the counter moves in the same
    // transaction as the state write.
    tx.execute(
        "INSERT INTO pickup_quota(student_id, day, completed_count)
         VALUES(?, ?, 1)
         ON CONFLICT(student_id, day) DO UPDATE SET
           completed_count = completed_count + 1",
        (&row.student_id, &day),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(request_json(&row))
}

fn pickup_cancel(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let request_id = get_required_str(params, "requestId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let version = next_version(&tx)?;
    let row = transition(
        &tx,
        &request_id,
        &[STATUS_PENDING, STATUS_CONFIRMED],
        "UPDATE pickup_requests
         SET status = 'cancelled', version = ?
         WHERE id = ? AND status IN ('pending', 'confirmed')",
        rusqlite::params![version, request_id],
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(request_json(&row))
}

fn pickup_quota(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let day = match get_optional_str(params, "day")? {
        Some(raw) => parse_date(&raw, "day")?.format(DATE_FMT).to_string(),
        None => chrono::Local::now()
            .naive_local()
            .date()
            .format(DATE_FMT)
            .to_string(),
    };
    let count = completed_count(conn, &student_id, &day)?;
    Ok(json!({ "today_completed_count": count }))
}

fn pickup_snapshot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let since = params
        .get("sinceVersion")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let latest: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM pickup_requests",
            [],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, status, request_time, confirmation_time, completion_time, version
             FROM pickup_requests
             WHERE version > ?
             ORDER BY version",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([since], |r| {
            Ok(RequestRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                status: r.get(2)?,
                request_time: r.get(3)?,
                confirmation_time: r.get(4)?,
                completion_time: r.get(5)?,
                version: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let requests: Vec<serde_json::Value> = rows.iter().map(request_json).collect();
    Ok(json!({ "version": latest, "requests": requests }))
}

fn pickup_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, status, request_time, confirmation_time, completion_time, version
             FROM pickup_requests
             WHERE student_id = ?
             ORDER BY request_time DESC, version DESC",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(RequestRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                status: r.get(2)?,
                request_time: r.get(3)?,
                confirmation_time: r.get(4)?,
                completion_time: r.get(5)?,
                version: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let requests: Vec<serde_json::Value> = rows.iter().map(request_json).collect();
    Ok(json!({ "requests": requests }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "pickup.request" => pickup_request(conn, &req.params),
        "pickup.confirm" => pickup_confirm(conn, &req.params),
        "pickup.complete" => pickup_complete(conn, &req.params),
        "pickup.cancel" => pickup_cancel(conn, &req.params),
        "pickup.quota" => pickup_quota(conn, &req.params),
        "pickup.snapshot" => pickup_snapshot(conn, &req.params),
        "pickup.list" => pickup_list(conn, &req.params),
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
        "pickup.request" | "pickup.confirm" | "pickup.complete" | "pickup.cancel"
        | "pickup.quota" | "pickup.snapshot" | "pickup.list" => Some(dispatch(state, req)),
        _ => None,
    }
}
