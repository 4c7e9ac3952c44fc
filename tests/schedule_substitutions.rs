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
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "d",
        "schedule.setDays",
        json!({ "days": [
            { "id": 0, "name": "Monday", "short": "Mo" },
            { "id": 1, "name": "Tuesday", "short": "Tu" },
            { "id": 2, "name": "Wednesday", "short": "We" },
            { "id": 3, "name": "Thursday", "short": "Th" },
            { "id": 4, "name": "Friday", "short": "Fr" },
            { "id": 5, "name": "Saturday", "short": "Sa" },
            { "id": 6, "name": "Sunday", "short": "Su" }
        ] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "p",
        "schedule.setPeriods",
        json!({ "periods": [
            { "id": 1, "number": 1, "startTime": "08:00", "endTime": "08:45" },
            { "id": 2, "number": 2, "startTime": "08:55", "endTime": "09:40" },
            { "id": 3, "number": 3, "startTime": "09:50", "endTime": "10:35" }
        ] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "timetable.replace",
        json!({ "entries": [
            {
                "dayId": 6,
                "period": 3,
                "className": "8A",
                "subjectName": "Math",
                "teacherId": "t-regular",
                "classroomName": "201"
            }
        ] }),
    );

    Fixture {
        child,
        stdin,
        reader,
        workspace,
    }
}

fn cells_of(result: &serde_json::Value) -> Vec<serde_json::Value> {
    result["cells"].as_array().expect("cells").to_vec()
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
fn dated_substitution_matches_only_its_week() {
    let mut f = setup("schoolops-sched-dated");
    // 2024-03-10 is a Sunday, period 3: overrides the regular cell above.
    let _ = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "sub",
        "substitutions.record",
        json!({
            "teacher_id": "t-sub",
            "period_xml_id": 3,
            "assignment_date": "2024-03-10",
            "class_name": "8A",
            "subject_name": "Math"
        }),
    );

    // Anchor inside the week containing 2024-03-10 (week of Mar 4-10).
    let result = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q1",
        "schedule.effective",
        json!({ "className": "8A", "weekAnchorDate": "2024-03-06" }),
    );
    let cells = cells_of(&result);
    assert_eq!(cells.len(), 1);
    let cell = &cells[0];
    assert_eq!(cell["kind"].as_str(), Some("both"));
    assert_eq!(cell["date"].as_str(), Some("2024-03-10"));
    assert_eq!(
        cell["regular"]["teacherId"].as_str(),
        Some("t-regular"),
        "regular side keeps the normal teacher"
    );
    assert_eq!(
        cell["substitution"]["teacher_id"].as_str(),
        Some("t-sub"),
        "substitution side names the stand-in"
    );

    // One week later the same day-of-week resolves to 2024-03-17: the
    // override must not resurface there.
    let result = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q2",
        "schedule.effective",
        json!({ "className": "8A", "weekAnchorDate": "2024-03-13" }),
    );
    let cells = cells_of(&result);
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0]["kind"].as_str(), Some("regular"));
    assert_eq!(cells[0]["date"].as_str(), Some("2024-03-17"));
    teardown(f);
}

#[test]
fn substitution_without_regular_entry_is_substituted_cell() {
    let mut f = setup("schoolops-sched-solo");
    // Tuesday period 1 has no timetable entry for this teacher.
    let _ = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "sub",
        "substitutions.record",
        json!({
            "teacher_id": "t-sub",
            "period_xml_id": 1,
            "assignment_date": "2024-03-12",
            "class_name": "7C",
            "subject_name": "Geography"
        }),
    );

    let result = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q",
        "schedule.effective",
        json!({ "teacherId": "t-sub", "weekAnchorDate": "2024-03-11" }),
    );
    let cells = cells_of(&result);
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0]["kind"].as_str(), Some("substituted"));
    assert_eq!(cells[0]["dayId"].as_i64(), Some(1));
    assert!(cells[0]["regular"].is_null());
    teardown(f);
}

#[test]
fn period_must_match_for_a_dated_substitution() {
    let mut f = setup("schoolops-sched-period");
    let _ = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "sub",
        "substitutions.record",
        json!({
            "teacher_id": "t-sub",
            "period_xml_id": 2,
            "assignment_date": "2024-03-10",
            "class_name": "8A",
            "subject_name": "Math"
        }),
    );

    let result = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q",
        "schedule.effective",
        json!({ "className": "8A", "weekAnchorDate": "2024-03-06" }),
    );
    let cells = cells_of(&result);
    // Period 3 keeps its regular teacher; period 2 picks up the override.
    let kinds: Vec<(i64, String)> = cells
        .iter()
        .map(|c| {
            (
                c["period"].as_i64().expect("period"),
                c["kind"].as_str().expect("kind").to_string(),
            )
        })
        .collect();
    assert!(kinds.contains(&(2, "substituted".to_string())));
    assert!(kinds.contains(&(3, "regular".to_string())));
    teardown(f);
}

#[test]
fn dateless_substitution_only_applies_without_anchor() {
    let mut f = setup("schoolops-sched-dateless");
    let _ = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "sub",
        "substitutions.record",
        json!({
            "teacher_id": "t-sub",
            "period_xml_id": 3,
            "day_xml_id": 6,
            "class_name": "8A",
            "subject_name": "Math"
        }),
    );

    // With a week anchor the stale date-less override stays hidden.
    let result = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q1",
        "schedule.effective",
        json!({ "className": "8A", "weekAnchorDate": "2024-03-06" }),
    );
    let cells = cells_of(&result);
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0]["kind"].as_str(), Some("regular"));

    // Without any anchor the legacy (day, period) fallback applies.
    let result = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q2",
        "schedule.effective",
        json!({ "className": "8A" }),
    );
    let cells = cells_of(&result);
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0]["kind"].as_str(), Some("both"));
    assert!(cells[0]["date"].is_null());
    teardown(f);
}

#[test]
fn ranged_substitution_covers_each_matching_week() {
    let mut f = setup("schoolops-sched-ranged");
    let _ = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "sub",
        "substitutions.record",
        json!({
            "teacher_id": "t-sub",
            "period_xml_id": 3,
            "day_xml_id": 6,
            "substitution_start_date": "2024-03-04",
            "substitution_end_date": "2024-03-17",
            "class_name": "8A",
            "subject_name": "Math"
        }),
    );

    // Both Sundays inside the range are overridden.
    for (qid, anchor) in [("q1", "2024-03-06"), ("q2", "2024-03-13")] {
        let result = request_ok(
            &mut f.stdin,
            &mut f.reader,
            qid,
            "schedule.effective",
            json!({ "className": "8A", "weekAnchorDate": anchor }),
        );
        let cells = cells_of(&result);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0]["kind"].as_str(), Some("both"), "anchor {}", anchor);
    }

    // The Sunday after the range ends is back to normal.
    let result = request_ok(
        &mut f.stdin,
        &mut f.reader,
        "q3",
        "schedule.effective",
        json!({ "className": "8A", "weekAnchorDate": "2024-03-20" }),
    );
    let cells = cells_of(&result);
    assert_eq!(cells[0]["kind"].as_str(), Some("regular"));
    teardown(f);
}

#[test]
fn selector_requires_exactly_one_of_teacher_or_class() {
    let mut f = setup("schoolops-sched-selector");
    let r = request(
        &mut f.stdin,
        &mut f.reader,
        "q",
        "schedule.effective",
        json!({ "weekAnchorDate": "2024-03-06" }),
    );
    assert_eq!(r["ok"].as_bool(), Some(false));
    assert_eq!(r["error"]["code"].as_str(), Some("bad_params"));
    teardown(f);
}
