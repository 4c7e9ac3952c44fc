use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, parse_date, parse_datetime, require_student, HandlerErr,
    DATETIME_FMT, DATE_FMT,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, ScanRecord, ScanType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn bus_exists(conn: &Connection, bus_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM buses WHERE id = ?", [bus_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn event_json(
    id: &str,
    student_id: &str,
    bus_id: &str,
    scan_type: ScanType,
    scan_time: &str,
    location: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": id,
        "student_id": student_id,
        "bus_id": bus_id,
        "scan_type": scan_type.as_str(),
        "scan_time": scan_time,
        "location": location
    })
}

fn scans_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let bus_id = get_required_str(params, "busId")?;
    let scan_type_raw = get_required_str(params, "scanType")?;
    let scan_time_raw = get_required_str(params, "scanTime")?;
    let location = get_optional_str(params, "location")?;
    let explicit_id = get_optional_str(params, "id")?;

    let Some(scan_type) = ScanType::parse(&scan_type_raw) else {
        return Err(HandlerErr::new(
            "validation_error",
            format!("scan type must be board or exit, got '{}'", scan_type_raw),
        ));
    };
    let scan_time = parse_datetime(&scan_time_raw, "scanTime")?;
    let scan_time_text = scan_time.format(DATETIME_FMT).to_string();
    let scan_day = scan_time.date().format(DATE_FMT).to_string();

    require_student(conn, &student_id)?;
    if !bus_exists(conn, &bus_id)? {
        return Err(HandlerErr::new("not_found", "bus not found"));
    }

    // Same explicit id, or same (student, bus, type, time) identity: the
    // retrying device already got this event in. Leave the ledger untouched.
    if let Some(id) = explicit_id.as_deref() {
        let known = conn
            .query_row("SELECT 1 FROM scan_events WHERE id = ?", [id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(HandlerErr::db)?
            .is_some();
        if known {
            return Err(HandlerErr::with_details(
                "duplicate_event",
                "scan event already recorded",
                json!({ "id": id }),
            ));
        }
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM scan_events
             WHERE student_id = ? AND bus_id = ? AND scan_type = ? AND scan_time = ?",
            (&student_id, &bus_id, scan_type.as_str(), &scan_time_text),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(id) = existing {
        return Err(HandlerErr::with_details(
            "duplicate_event",
            "scan event already recorded",
            json!({ "id": id }),
        ));
    }

    let id = explicit_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO scan_events(id, student_id, bus_id, scan_type, scan_time, scan_day, location)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &bus_id,
            scan_type.as_str(),
            &scan_time_text,
            &scan_day,
            &location,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(event_json(
        &id,
        &student_id,
        &bus_id,
        scan_type,
        &scan_time_text,
        location.as_deref(),
    ))
}

struct DayEvent {
    record: ScanRecord,
    full_name: String,
    class_name: String,
}

fn load_day_events(
    conn: &Connection,
    bus_id: &str,
    day: &str,
) -> Result<Vec<DayEvent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT e.student_id, e.scan_type, e.scan_time, s.last_name, s.first_name, c.name
             FROM scan_events e
             JOIN students s ON s.id = e.student_id
             JOIN classes c ON c.id = s.class_id
             WHERE e.bus_id = ? AND e.scan_day = ?",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((bus_id, day), |r| {
            let student_id: String = r.get(0)?;
            let type_raw: String = r.get(1)?;
            let time_raw: String = r.get(2)?;
            let last: String = r.get(3)?;
            let first: String = r.get(4)?;
            let class_name: String = r.get(5)?;
            Ok((student_id, type_raw, time_raw, last, first, class_name))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut events = Vec::with_capacity(rows.len());
    for (student_id, type_raw, time_raw, last, first, class_name) in rows {
        let Some(scan_type) = ScanType::parse(&type_raw) else {
            return Err(HandlerErr::with_details(
                "db_query_failed",
                "stored scan event has non-canonical type",
                json!({ "scanType": type_raw }),
            ));
        };
        let scan_time = parse_datetime(&time_raw, "scan_time")?;
        events.push(DayEvent {
            record: ScanRecord {
                student_id,
                scan_type,
                scan_time,
            },
            full_name: format!("{}, {}", last, first),
            class_name,
        });
    }
    Ok(events)
}

fn scans_roster(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let bus_id = get_required_str(params, "busId")?;
    let day_raw = get_required_str(params, "day")?;
    let day = parse_date(&day_raw, "day")?.format(DATE_FMT).to_string();
    if !bus_exists(conn, &bus_id)? {
        return Err(HandlerErr::new("not_found", "bus not found"));
    }

    let events = load_day_events(conn, &bus_id, &day)?;
    let records: Vec<ScanRecord> = events.iter().map(|e| e.record.clone()).collect();
    let aboard = roster::on_board(&records);

    let students: Vec<serde_json::Value> = aboard
        .iter()
        .filter_map(|(student_id, board_time)| {
            let info = events.iter().find(|e| &e.record.student_id == student_id)?;
            Some(json!({
                "id": student_id,
                "fullName": info.full_name,
                "class_name": info.class_name,
                "board_time": board_time.format(DATETIME_FMT).to_string()
            }))
        })
        .collect();

    Ok(json!({ "students": students }))
}

fn scans_counts(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let bus_id = get_required_str(params, "busId")?;
    let day_raw = get_required_str(params, "day")?;
    let day = parse_date(&day_raw, "day")?.format(DATE_FMT).to_string();
    if !bus_exists(conn, &bus_id)? {
        return Err(HandlerErr::new("not_found", "bus not found"));
    }

    let events = load_day_events(conn, &bus_id, &day)?;
    let records: Vec<ScanRecord> = events.iter().map(|e| e.record.clone()).collect();
    let counts = roster::day_counts(&records);
    Ok(json!({ "boarded": counts.boarded, "exited": counts.exited }))
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = match req.method.as_str() {
        "scans.record" => scans_record(conn, &req.params),
        "scans.roster" => scans_roster(conn, &req.params),
        "scans.counts" => scans_counts(conn, &req.params),
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
        "scans.record" | "scans.roster" | "scans.counts" => Some(dispatch(state, req)),
        _ => None,
    }
}
