use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolopsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolopsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    workspace: PathBuf,
    student_id: String,
    seq: u64,
}

fn setup(prefix: &str) -> Fixture {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "w",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c",
        "classes.create",
        json!({ "name": "8A" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s",
        "students.create",
        json!({ "classId": class_id, "lastName": "Okafor", "firstName": "Ben" }),
    );

    Fixture {
        child,
        stdin,
        reader,
        workspace,
        student_id: student["studentId"].as_str().expect("studentId").to_string(),
        seq: 100,
    }
}

fn record_mark(
    f: &mut Fixture,
    date: &str,
    period: i64,
    present: bool,
    absent: bool,
    late: bool,
    excused: bool,
) -> serde_json::Value {
    f.seq += 1;
    let id = f.seq.to_string();
    request(
        &mut f.stdin,
        &mut f.reader,
        &id,
        "attendance.record",
        json!({
            "student_id": f.student_id,
            "date": date,
            "class_time_num": period,
            "class_name": "8A",
            "subject_name": "Math",
            "teacher_name": "T. Adams",
            "is_present": present,
            "is_absent": absent,
            "is_late": late,
            "is_excused": excused
        }),
    )
}

fn teardown(f: Fixture) {
    let Fixture {
        mut child,
        stdin,
        workspace,
        ..
    } = f;
    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn rate_is_80_for_ten_records_two_absent() {
    let mut f = setup("schoolops-attendance-rate");
    for day in 1..=8 {
        let r = record_mark(&mut f, &format!("2024-03-{:02}", day), 1, true, false, false, false);
        assert_eq!(r["ok"].as_bool(), Some(true), "mark failed: {}", r);
    }
    let _ = record_mark(&mut f, "2024-03-09", 1, false, true, false, false);
    let _ = record_mark(&mut f, "2024-03-10", 1, false, true, false, false);

    let stats = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q",
        "attendance.statistics",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(stats["total_records"].as_i64(), Some(10));
    assert_eq!(stats["absent_count"].as_i64(), Some(2));
    assert_eq!(stats["attendance_rate"].as_i64(), Some(80));
    assert!(stats.get("behavior_note").is_none());
    teardown(f);
}

#[test]
fn rate_is_zero_without_records() {
    let mut f = setup("schoolops-attendance-empty");
    let stats = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q",
        "attendance.statistics",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(stats["total_records"].as_i64(), Some(0));
    assert_eq!(stats["attendance_rate"].as_i64(), Some(0));
    teardown(f);
}

#[test]
fn overlapping_flags_are_preserved_not_normalized() {
    let mut f = setup("schoolops-attendance-flags");
    // Simultaneously late, absent and excused; the source ambiguity stays.
    let r = record_mark(&mut f, "2024-03-11", 2, false, true, true, true);
    assert_eq!(r["ok"].as_bool(), Some(true));

    let stats = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q1",
        "attendance.statistics",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(stats["absent_count"].as_i64(), Some(1));
    assert_eq!(stats["late_count"].as_i64(), Some(1));
    assert_eq!(stats["excused_count"].as_i64(), Some(1));

    let history = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q2",
        "attendance.history",
        json!({ "studentId": f.student_id }),
    );
    let mark = &history["groups"][0]["sessions"][0];
    assert_eq!(mark["is_absent"].as_bool(), Some(true));
    assert_eq!(mark["is_late"].as_bool(), Some(true));
    assert_eq!(mark["is_excused"].as_bool(), Some(true));
    teardown(f);
}

#[test]
fn behavior_note_joins_statistics_when_present() {
    let mut f = setup("schoolops-attendance-note");
    let _ = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "n",
        "notes.set",
        json!({ "studentId": f.student_id, "note": "works well in groups" }),
    );
    let stats = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q",
        "attendance.statistics",
        json!({ "studentId": f.student_id }),
    );
    assert_eq!(
        stats["behavior_note"].as_str(),
        Some("works well in groups")
    );
    teardown(f);
}

#[test]
fn history_groups_by_date_desc_then_period_asc() {
    let mut f = setup("schoolops-attendance-history");
    let _ = record_mark(&mut f, "2024-03-11", 3, true, false, false, false);
    let _ = record_mark(&mut f, "2024-03-12", 2, true, false, false, false);
    let _ = record_mark(&mut f, "2024-03-11", 1, true, false, false, false);
    let _ = record_mark(&mut f, "2024-03-12", 1, false, false, true, false);

    let history = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q",
        "attendance.history",
        json!({ "studentId": f.student_id }),
    );
    let groups = history["groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["date"].as_str(), Some("2024-03-12"));
    assert_eq!(groups[1]["date"].as_str(), Some("2024-03-11"));

    let periods: Vec<i64> = groups[0]["sessions"]
        .as_array()
        .expect("sessions")
        .iter()
        .map(|m| m["class_time_num"].as_i64().expect("period"))
        .collect();
    assert_eq!(periods, vec![1, 2]);
    teardown(f);
}

#[test]
fn second_mark_for_same_session_conflicts() {
    let mut f = setup("schoolops-attendance-conflict");
    let first = record_mark(&mut f, "2024-03-11", 1, true, false, false, false);
    assert_eq!(first["ok"].as_bool(), Some(true));

    let second = record_mark(&mut f, "2024-03-11", 1, false, true, false, false);
    assert_eq!(second["ok"].as_bool(), Some(false));
    assert_eq!(
        second["error"]["code"].as_str(),
        Some("conflict"),
        "unexpected: {}",
        second
    );
    teardown(f);
}
