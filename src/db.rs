use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schoolops.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS buses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    // Append-only. Ridership is derived from the highest-timestamp event per
    // (student, bus, day); the UNIQUE constraint is the duplicate-submission
    // backstop for retrying scan devices.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scan_events(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            bus_id TEXT NOT NULL,
            scan_type TEXT NOT NULL,
            scan_time TEXT NOT NULL,
            scan_day TEXT NOT NULL,
            location TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(bus_id) REFERENCES buses(id),
            UNIQUE(student_id, bus_id, scan_type, scan_time)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scan_events_bus_day ON scan_events(bus_id, scan_day)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scan_events_student ON scan_events(student_id)",
        [],
    )?;

    // One mark per (student, date, class, period). Flags are stored exactly
    // as submitted; they are not mutually exclusive in the source data.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            class_time_num INTEGER NOT NULL,
            class_name TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            is_present INTEGER NOT NULL,
            is_absent INTEGER NOT NULL,
            is_late INTEGER NOT NULL,
            is_excused INTEGER NOT NULL,
            excuse_note TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, date, class_name, class_time_num)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_marks_student ON attendance_marks(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_marks_date ON attendance_marks(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS behavior_notes(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            note TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS days(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            short TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id INTEGER PRIMARY KEY,
            number INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_entries(
            id TEXT PRIMARY KEY,
            day_id INTEGER NOT NULL,
            period_id INTEGER NOT NULL,
            class_name TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            classroom_name TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_entries_teacher ON timetable_entries(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_entries_class ON timetable_entries(class_name)",
        [],
    )?;

    // Integer AUTOINCREMENT ids: the resolver breaks ties on lowest id, so
    // ids must be totally ordered by insertion.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS substitutions(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            teacher_id TEXT NOT NULL,
            period_id INTEGER NOT NULL,
            day_id INTEGER,
            assignment_date TEXT,
            start_date TEXT,
            end_date TEXT,
            class_name TEXT NOT NULL,
            subject_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_teacher ON substitutions(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_class ON substitutions(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pickup_requests(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            request_time TEXT NOT NULL,
            confirmation_time TEXT,
            completion_time TEXT,
            version INTEGER NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_pickup_requests_version(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pickup_requests_student ON pickup_requests(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pickup_requests_version ON pickup_requests(version)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pickup_quota(
            student_id TEXT NOT NULL,
            day TEXT NOT NULL,
            completed_count INTEGER NOT NULL,
            PRIMARY KEY(student_id, day),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_pickup_requests_version(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before the snapshot feed lack the version column.
    // Backfill from rowid, which preserves the original transition order.
    if table_has_column(conn, "pickup_requests", "version")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE pickup_requests ADD COLUMN version INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    conn.execute("UPDATE pickup_requests SET version = rowid", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
