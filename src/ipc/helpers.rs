use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{Connection, OptionalExtension};

use crate::ipc::error::err;

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn db(e: rusqlite::Error) -> HandlerErr {
        HandlerErr::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be a string", key))),
    }
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be an integer", key))),
    }
}

pub fn get_required_bool(params: &serde_json::Value, key: &str) -> Result<bool, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// Date values are normalized to date-only text; time-of-day never leaks
/// into date comparisons.
pub fn parse_date(value: &str, field: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(value.trim(), DATE_FMT).map_err(|_| {
        HandlerErr::new(
            "validation_error",
            format!("{} must be YYYY-MM-DD, got '{}'", field, value),
        )
    })
}

pub fn parse_datetime(value: &str, field: &str) -> Result<NaiveDateTime, HandlerErr> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, DATETIME_FMT)
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| {
            HandlerErr::new(
                "validation_error",
                format!("{} must be YYYY-MM-DDTHH:MM:SS, got '{}'", field, value),
            )
        })
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

pub fn require_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    if student_exists(conn, student_id)? {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", "student not found"))
    }
}
