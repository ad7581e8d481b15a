//! Unit tests for the client definition loader and file-backed store.

use std::fs;

use evalbridge::store::loader::ClientLoader;
use evalbridge::store::{ClientStore, FileClientStore};
use evalbridge::AppError;

const PARIS_CLIENT: &str = r#"
client_id = "c1"
name = "Geography bot"
secret_key = "s"

[[evaluations]]
id = "e1"
name = "Capital of France"
description = "Answer with the capital of France."
tool = "echo"
timeout = 5000
input = { text = "Paris" }

[evaluations.validation]
type = "llm-judge"
criteria = ["names Paris"]
threshold = 0.8

[[evaluations]]
id = "e2"
name = "Second"
tool = "echo"
"#;

#[test]
fn parse_reads_evaluations_and_validation() {
    let client = ClientLoader::parse(PARIS_CLIENT).expect("parses");

    assert_eq!(client.client_id, "c1");
    assert_eq!(client.evaluations.len(), 2);
    let e1 = client.evaluation("e1").expect("e1 defined");
    assert_eq!(e1.timeout, Some(5000));
    assert_eq!(e1.input["text"], "Paris");
    let validation = e1.validation.as_ref().expect("validation block");
    assert!(validation.uses_judge());
    assert!((validation.threshold() - 0.8).abs() < f64::EPSILON);
    assert!(client.evaluation("e2").expect("e2").validation.is_none());
}

#[test]
fn duplicate_evaluation_ids_are_rejected() {
    let raw = r#"
client_id = "c1"
[[evaluations]]
id = "e1"
name = "a"
tool = "echo"
[[evaluations]]
id = "e1"
name = "b"
tool = "echo"
"#;
    let err = ClientLoader::parse(raw).expect_err("duplicate ids");
    assert!(matches!(err, AppError::Store(ref msg) if msg.contains("twice")));
}

#[test]
fn load_dir_skips_broken_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("c1.toml"), PARIS_CLIENT).expect("write");
    fs::write(temp.path().join("broken.toml"), "client_id = [").expect("write");
    fs::write(temp.path().join("notes.txt"), "ignored").expect("write");

    let clients = ClientLoader::load_dir(temp.path()).expect("dir readable");

    assert_eq!(clients.len(), 1);
    assert!(clients.contains_key("c1"));
}

#[test]
fn load_dir_on_missing_directory_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let err = ClientLoader::load_dir(&temp.path().join("missing")).expect_err("no dir");
    assert!(matches!(err, AppError::Store(_)));
}

#[test]
fn store_validates_credentials() {
    let store = FileClientStore::from_clients([ClientLoader::parse(PARIS_CLIENT).expect("parses")]);

    assert!(store.validate("c1", Some("s")).valid);
    assert_eq!(
        store.validate("c1", Some("x")).reason.as_deref(),
        Some("invalid secret key")
    );
    assert_eq!(
        store.validate("ghost", Some("s")).reason.as_deref(),
        Some("unknown client 'ghost'")
    );
}

#[test]
fn store_lists_and_gets_evaluations() {
    let store = FileClientStore::from_clients([ClientLoader::parse(PARIS_CLIENT).expect("parses")]);

    let ids: Vec<String> = store
        .list_evaluations("c1")
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["e1".to_owned(), "e2".to_owned()]);
    assert!(store.get_evaluation("c1", "e2").is_some());
    assert!(store.get_evaluation("c1", "nope").is_none());
    assert!(store.list_evaluations("ghost").is_empty());
}

#[test]
fn reload_picks_up_new_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("c1.toml"), PARIS_CLIENT).expect("write");
    let store = FileClientStore::load(temp.path()).expect("loads");
    assert_eq!(store.list_clients().len(), 1);

    fs::write(
        temp.path().join("c2.toml"),
        "client_id = \"c2\"\n[[evaluations]]\nid = \"x\"\nname = \"x\"\ntool = \"echo\"\n",
    )
    .expect("write");

    assert_eq!(store.reload().expect("reload"), 2);
    assert!(store.get("c2").is_some());
}
