//! Unit tests for `JsonlResultWriter`.

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use evalbridge::models::evaluation::{EvaluationRecord, EvaluationStatus};
use evalbridge::results::{JsonlResultWriter, ResultEntry, ResultLogger};
use serde_json::Value;

fn failed_record(evaluation_id: &str) -> EvaluationRecord {
    let mut record = EvaluationRecord::pending("c1:default", evaluation_id);
    record.status = EvaluationStatus::Failed;
    record.duration_ms = Some(5000);
    record.error = Some("timeout: evaluate call timed out after 5000 ms".into());
    record
}

#[test]
fn new_creates_missing_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("a").join("b");

    JsonlResultWriter::new(dir.clone()).expect("constructs");
    assert!(dir.is_dir());
}

#[test]
fn entries_are_appended_as_json_lines() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlResultWriter::new(temp.path().to_owned()).expect("constructs");

    writer
        .log_result(&ResultEntry::from_record(&failed_record("e1")))
        .expect("write 1");
    writer
        .log_result(&ResultEntry::from_record(&failed_record("e2")))
        .expect("write 2");

    let path = writer.file_for_date(Utc::now().date_naive());
    let content = fs::read_to_string(&path).expect("file written");
    let lines: Vec<Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid json line"))
        .collect();

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["evaluation_id"], "e1");
    assert_eq!(lines[0]["status"], "failed");
    assert_eq!(lines[0]["duration_ms"], 5000);
    assert!(lines[0]["error"]
        .as_str()
        .expect("error text")
        .contains("timed out"));
    assert_eq!(lines[1]["evaluation_id"], "e2");
}

#[test]
fn file_name_carries_date() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlResultWriter::new(temp.path().to_owned()).expect("constructs");
    let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date");

    assert_eq!(
        writer.file_for_date(date),
        temp.path().join("results-2026-03-01.jsonl")
    );
}

#[test]
fn concurrent_writes_stay_line_delimited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = Arc::new(JsonlResultWriter::new(temp.path().to_owned()).expect("constructs"));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || {
                writer
                    .log_result(&ResultEntry::from_record(&failed_record(&format!("e{i}"))))
                    .expect("write");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }

    let content =
        fs::read_to_string(writer.file_for_date(Utc::now().date_naive())).expect("file written");
    assert_eq!(content.lines().count(), 8);
    for line in content.lines() {
        serde_json::from_str::<Value>(line).expect("valid json line");
    }
}

#[test]
fn entries_land_in_the_file_of_their_finish_date() {
    let temp = tempfile::tempdir().expect("tempdir");
    let writer = JsonlResultWriter::new(temp.path().to_owned()).expect("constructs");
    let day = |d| {
        chrono::NaiveDate::from_ymd_opt(2026, 3, d)
            .expect("valid date")
            .and_hms_opt(23, 59, 0)
            .expect("valid time")
            .and_utc()
    };

    for (date, evaluation_id) in [(day(1), "e1"), (day(2), "e2"), (day(1), "e3")] {
        let mut entry = ResultEntry::from_record(&failed_record(evaluation_id));
        entry.timestamp = date;
        writer.log_result(&entry).expect("write");
    }

    let read = |d| {
        let date = chrono::NaiveDate::from_ymd_opt(2026, 3, d).expect("valid date");
        fs::read_to_string(writer.file_for_date(date))
            .expect("file written")
            .lines()
            .map(|line| {
                let entry: Value = serde_json::from_str(line).expect("valid json line");
                entry["evaluation_id"].clone()
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(read(1), vec![Value::from("e1"), Value::from("e3")]);
    assert_eq!(read(2), vec![Value::from("e2")]);
}
