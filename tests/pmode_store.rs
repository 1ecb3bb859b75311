use as4_engine::model::Mep;
use as4_engine::pmode::{
    load_directory, parse_sending_pmode, PModeLoadError, PModeStore, PModeWatcher,
    RECEIVING_DIR, SENDING_DIR,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const INVOICE_PUSH: &str = r#"
id: invoice-push
push_configuration:
  url: http://partner.test/as4
  timeout: 30s
reliability:
  reception_awareness:
    enabled: true
    retry_count: 3
    retry_interval: 5000
message_packaging:
  party_info:
    from:
      role: Sender
      party_ids:
        - id: org:holodeck:sender
    to:
      role: Receiver
      party_ids:
        - id: org:holodeck:receiver
  collaboration:
    service:
      value: urn:as4:test:invoicing
    action: StoreInvoice
"#;

const INVOICE_IN: &str = r#"
id: invoice-in
message_packaging:
  collaboration:
    service:
      value: urn:as4:test:invoicing
    action: StoreInvoice
message_handling:
  deliver:
    enabled: true
    method:
      type: file
      parameters:
        location: /var/as4/in
"#;

fn write(root: &Path, dir: &str, name: &str, contents: &str) {
    let dir = root.join(dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn valid_files_are_loaded_with_their_settings() {
    let root = tempfile::tempdir().unwrap();
    write(root.path(), SENDING_DIR, "invoice-push.yaml", INVOICE_PUSH);
    write(root.path(), RECEIVING_DIR, "invoice-in.yml", INVOICE_IN);

    let report = load_directory(root.path()).unwrap();

    assert!(report.is_clean(), "{:?} {:?}", report.rejected, report.warnings);
    assert_eq!(report.snapshot.len(), 2);
    let sending = report.snapshot.sending_pmode("invoice-push").unwrap();
    assert_eq!(sending.mep_binding, Mep::Push);
    let push = sending.push_configuration.as_ref().unwrap();
    assert_eq!(push.timeout, Some(Duration::from_secs(30)));
    let awareness = &sending.reliability.reception_awareness;
    assert_eq!(awareness.retry_interval, Duration::from_secs(5));
    assert_eq!(awareness.retry_count, 3);

    let receiving = report.snapshot.receiving_pmode("invoice-in").unwrap();
    let method = receiving.message_handling.deliver.method.as_ref().unwrap();
    assert_eq!(method.method_type, "file");
    assert_eq!(method.parameter("location"), Some("/var/as4/in"));
}

#[test]
fn broken_files_are_rejected_without_failing_the_load() {
    let root = tempfile::tempdir().unwrap();
    write(root.path(), SENDING_DIR, "a-invoice-push.yaml", INVOICE_PUSH);
    write(root.path(), SENDING_DIR, "b-no-url.yaml", "id: no-url\n");
    write(root.path(), SENDING_DIR, "c-garbled.yaml", "id: [unclosed\n");
    write(root.path(), SENDING_DIR, "d-again.yaml", INVOICE_PUSH);
    write(root.path(), SENDING_DIR, "notes.txt", "ignored");
    write(
        root.path(),
        RECEIVING_DIR,
        "unknown-field.yaml",
        "id: invoice-in\nsurprise: true\n",
    );

    let report = load_directory(root.path()).unwrap();

    assert_eq!(report.snapshot.len(), 1);
    assert!(report.snapshot.sending_pmode("invoice-push").is_some());
    assert_eq!(report.rejected.len(), 4, "{:?}", report.rejected);
    assert!(matches!(
        &report.rejected[0],
        PModeLoadError::Invalid { path, .. } if path.ends_with("b-no-url.yaml")
    ));
    assert!(report.rejected[0].to_string().contains("push_configuration"));
    assert!(matches!(&report.rejected[1], PModeLoadError::Parse { .. }));
    assert!(matches!(
        &report.rejected[2],
        PModeLoadError::Duplicate { id, .. } if id == "invoice-push"
    ));
    assert!(matches!(&report.rejected[3], PModeLoadError::Parse { .. }));
}

#[test]
fn identical_receiving_criteria_are_reported_as_a_warning() {
    let root = tempfile::tempdir().unwrap();
    write(root.path(), RECEIVING_DIR, "first.yaml", INVOICE_IN);
    write(
        root.path(),
        RECEIVING_DIR,
        "second.yaml",
        &INVOICE_IN.replace("id: invoice-in", "id: invoice-in-copy"),
    );

    let report = load_directory(root.path()).unwrap();

    assert!(report.rejected.is_empty());
    assert_eq!(report.snapshot.receiving_pmodes().len(), 2);
    assert_eq!(report.warnings.len(), 1);
    assert!(!report.is_clean());
}

#[test]
fn missing_root_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let missing = root.path().join("nowhere");

    let err = load_directory(&missing).unwrap_err();

    assert!(matches!(err, PModeLoadError::Io { .. }));
}

#[test]
fn pull_binding_requires_a_partition() {
    let pmode = parse_sending_pmode("id: pull-only\nmep_binding: pull\n").unwrap();
    let err = as4_engine::pmode::validate_sending_pmode(&pmode).unwrap_err();
    assert!(err.to_string().contains("mpc"), "{err}");
}

#[test]
fn watcher_installs_new_snapshots_when_the_directory_changes() {
    let root = tempfile::tempdir().unwrap();
    write(root.path(), SENDING_DIR, "invoice-push.yaml", INVOICE_PUSH);
    let store = Arc::new(PModeStore::default());
    let mut watcher = PModeWatcher::new(root.path(), Arc::clone(&store), Duration::from_secs(1));

    assert!(watcher.reload());
    let before = store.snapshot();
    assert!(store.get_sending_pmode("invoice-push").is_some());
    assert!(store.get_receiving_pmodes().is_empty());
    assert!(!watcher.poll_changed());

    write(root.path(), RECEIVING_DIR, "invoice-in.yaml", INVOICE_IN);
    assert!(watcher.poll_changed());
    assert!(watcher.reload());

    let after = store.snapshot();
    assert!(after.generation() > before.generation());
    assert_eq!(store.get_receiving_pmodes().len(), 1);
    assert!(before.receiving_pmodes().is_empty());
    assert!(!watcher.poll_changed());
}

#[test]
fn watcher_keeps_the_last_snapshot_when_the_root_disappears() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("pmodes");
    write(&dir, SENDING_DIR, "invoice-push.yaml", INVOICE_PUSH);
    let store = Arc::new(PModeStore::default());
    let mut watcher = PModeWatcher::new(&dir, Arc::clone(&store), Duration::from_secs(1));
    assert!(watcher.reload());

    fs::remove_dir_all(&dir).unwrap();

    assert!(watcher.poll_changed());
    assert!(!watcher.reload());
    assert!(store.get_sending_pmode("invoice-push").is_some());
}
