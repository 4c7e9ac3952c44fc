use chrono::NaiveDateTime;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Board,
    Exit,
}

impl ScanType {
    pub fn parse(s: &str) -> Option<ScanType> {
        match s {
            "board" => Some(ScanType::Board),
            "exit" => Some(ScanType::Exit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanType::Board => "board",
            ScanType::Exit => "exit",
        }
    }

    // Equal-timestamp tie-break: exit outranks board, so the roster fails
    // toward "not aboard".
    fn rank(self) -> u8 {
        match self {
            ScanType::Board => 0,
            ScanType::Exit => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub student_id: String,
    pub scan_type: ScanType,
    pub scan_time: NaiveDateTime,
}

fn outranks(a: &ScanRecord, b: &ScanRecord) -> bool {
    (a.scan_time, a.scan_type.rank()) > (b.scan_time, b.scan_type.rank())
}

/// Students whose highest-timestamp event in `events` is a board, with that
/// event's time. Insertion order of `events` never matters; only `scan_time`
/// decides which event is current.
pub fn on_board(events: &[ScanRecord]) -> Vec<(String, NaiveDateTime)> {
    let mut latest: HashMap<&str, &ScanRecord> = HashMap::new();
    for e in events {
        match latest.get(e.student_id.as_str()) {
            Some(current) if !outranks(e, current) => {}
            _ => {
                latest.insert(e.student_id.as_str(), e);
            }
        }
    }

    let mut aboard: Vec<(String, NaiveDateTime)> = latest
        .values()
        .filter(|e| e.scan_type == ScanType::Board)
        .map(|e| (e.student_id.clone(), e.scan_time))
        .collect();
    aboard.sort_by(|a, b| a.0.cmp(&b.0));
    aboard
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayCounts {
    pub boarded: i64,
    pub exited: i64,
}

/// Per-type event counts for a day. These are plain filters over the event
/// set and are independent of the derived ridership state.
pub fn day_counts(events: &[ScanRecord]) -> DayCounts {
    let mut counts = DayCounts {
        boarded: 0,
        exited: 0,
    };
    for e in events {
        match e.scan_type {
            ScanType::Board => counts.boarded += 1,
            ScanType::Exit => counts.exited += 1,
        }
    }
    counts
}
