use super::*;
use crate::config::test_config;
use crate::sync::local_watcher::IdleWatcher;
use serde_json::{Value, json};
use std::sync::Mutex as StdMutex;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingNotifier {
    codes: StdMutex<Vec<NotifyCode>>,
}

impl RecordingNotifier {
    fn codes(&self) -> Vec<NotifyCode> {
        self.codes.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, code: NotifyCode, _context: &NotifyContext) {
        self.codes.lock().unwrap().push(code);
    }
}

struct Harness {
    server: MockServer,
    dir: TempDir,
    engine: Arc<SyncEngine>,
    watcher: Arc<IdleWatcher>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let watcher = Arc::new(IdleWatcher::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let config = Arc::new(test_config(dir.path(), &server.uri()));
        let engine = SyncEngine::new(config, watcher.clone(), notifier.clone()).unwrap();
        Self {
            server,
            dir,
            engine: Arc::new(engine),
            watcher,
            notifier,
        }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join("script_includes").join(name)
    }

    fn create(&self, name: &str, content: &str) -> PathBuf {
        let path = self.file(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn remember(&self, path: &Path, content: &str) {
        let record = self.engine.track_file(path).unwrap().unwrap();
        record.save_fingerprint(content.as_bytes(), None).await.unwrap();
    }

    fn sidecar(&self, name: &str) -> Value {
        let path = self
            .dir
            .path()
            .join(".sync_data/script_includes")
            .join(name);
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    async fn stored(&self, path: &Path) -> String {
        self.engine
            .track_file(path)
            .unwrap()
            .unwrap()
            .get_fingerprint()
            .await
    }
}

fn record_body(name: &str, script: &str) -> Value {
    json!({ "records": [{ "name": name, "script": script, "sys_id": format!("id-{name}") }] })
}

async fn mount_record(server: &MockServer, name: &str, script: &str, times: u64) {
    Mock::given(method("GET"))
        .and(path("/sys_script_include.do"))
        .and(query_param("sysparm_action", "getRecords"))
        .and(query_param("sysparm_query", format!("name={name}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(record_body(name, script)))
        .expect(times)
        .mount(server)
        .await;
}

async fn forbid_requests(server: &MockServer, verb: &str) {
    Mock::given(method(verb))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(server)
        .await;
}

#[tokio::test]
async fn empty_file_is_populated_from_record() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "function f(){}", 1).await;
    let file = h.create("JSUtil.js", "");

    h.engine.on_ready();
    assert_eq!(h.engine.on_add(&file, 0).await, Some(true));

    assert_eq!(std::fs::read_to_string(&file).unwrap(), "function f(){}");
    assert_eq!(
        h.sidecar("JSUtil.js"),
        json!({ "syncHash": fingerprint(b"function f(){}"), "sysId": "id-JSUtil" })
    );
    assert_eq!(h.notifier.codes(), vec![NotifyCode::ReceivedFile]);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test]
async fn add_before_ready_only_registers() {
    let h = Harness::new().await;
    forbid_requests(&h.server, "GET").await;
    let file = h.create("JSUtil.js", "");

    assert_eq!(h.engine.on_add(&file, 0).await, None);
    assert!(h.engine.cached(&normalize_path(&file)).is_some());
    assert!(h.notifier.codes().is_empty());
}

#[tokio::test]
async fn add_of_non_empty_file_is_ignored() {
    let h = Harness::new().await;
    forbid_requests(&h.server, "GET").await;
    let file = h.create("JSUtil.js", "var a;");

    h.engine.on_ready();
    assert_eq!(h.engine.on_add(&file, 6).await, None);
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "var a;");
}

#[tokio::test]
async fn unchanged_content_sends_nothing() {
    let h = Harness::new().await;
    forbid_requests(&h.server, "GET").await;
    forbid_requests(&h.server, "POST").await;
    let file = h.create("JSUtil.js", "var a = 1;");
    h.remember(&file, "var a = 1;").await;

    assert!(h.engine.send_file(&file).await.unwrap());
    assert!(h.notifier.codes().is_empty());
}

#[tokio::test]
async fn remote_edit_blocks_upload() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "theirs", 1).await;
    forbid_requests(&h.server, "POST").await;
    let file = h.create("JSUtil.js", "mine");
    h.remember(&file, "base").await;

    assert!(!h.engine.send_file(&file).await.unwrap());
    assert_eq!(h.notifier.codes(), vec![NotifyCode::NotInSync]);
    assert_eq!(h.stored(&file).await, fingerprint(b"base"));

    let record = h.engine.track_file(&file).unwrap().unwrap();
    assert_eq!(
        h.engine.check_in_sync(&record, b"mine").await.unwrap(),
        SyncDecision::Conflict
    );
}

#[tokio::test]
async fn convergent_edit_refreshes_fingerprint_without_upload() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "same", 1).await;
    forbid_requests(&h.server, "POST").await;
    let file = h.create("JSUtil.js", "same");
    h.remember(&file, "base").await;

    assert!(h.engine.send_file(&file).await.unwrap());
    assert_eq!(h.stored(&file).await, fingerprint(b"same"));
    assert!(h.notifier.codes().is_empty());
}

#[tokio::test]
async fn local_only_edit_is_pushed() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "base", 1).await;
    Mock::given(method("POST"))
        .and(path("/sys_script_include.do"))
        .and(query_param("sysparm_action", "update"))
        .and(query_param("sysparm_query", "name=JSUtil"))
        .and(body_json(json!({ "script": "new" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(record_body("JSUtil", "new")))
        .expect(1)
        .mount(&h.server)
        .await;
    let file = h.create("JSUtil.js", "new");
    h.remember(&file, "base").await;

    assert!(h.engine.send_file(&file).await.unwrap());
    assert_eq!(h.stored(&file).await, fingerprint(b"new"));
    assert_eq!(h.sidecar("JSUtil.js")["sysId"], json!("id-JSUtil"));
    assert_eq!(h.notifier.codes(), vec![NotifyCode::UploadComplete]);
}

#[tokio::test]
async fn failed_upload_is_reported_and_retryable() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "base", 1).await;
    Mock::given(method("POST"))
        .and(path("/sys_script_include.do"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;
    let file = h.create("JSUtil.js", "new");
    h.remember(&file, "base").await;

    assert!(!h.engine.send_file(&file).await.unwrap());
    assert_eq!(h.notifier.codes(), vec![NotifyCode::UploadError]);
    assert_eq!(h.stored(&file).await, fingerprint(b"base"));
    assert!(!h.engine.track_file(&file).unwrap().unwrap().has_errors());
}

#[tokio::test]
async fn download_then_send_is_a_no_op() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "function f(){}", 1).await;
    forbid_requests(&h.server, "POST").await;
    let file = h.file("JSUtil.js");

    assert!(h.engine.add_file(&file).await.unwrap());
    assert!(h.engine.send_file(&file).await.unwrap());
    assert_eq!(h.notifier.codes(), vec![NotifyCode::ReceivedFile]);
}

#[tokio::test]
async fn guarded_write_refuses_new_content_once() {
    let h = Harness::new().await;
    let file = h.create("JSUtil.js", "typed by user");
    let record = h.engine.track_file(&file).unwrap().unwrap();

    record.mark_newly_discovered(true);
    assert!(!h.engine.guarded_write(&record, b"remote").await.unwrap());
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "typed by user");
    assert!(!record.take_newly_discovered());

    assert!(h.engine.guarded_write(&record, b"remote").await.unwrap());
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "remote");
}

#[tokio::test]
async fn content_written_during_discovery_is_uploaded_instead() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "function f(){}", 2).await;
    Mock::given(method("POST"))
        .and(path("/sys_script_include.do"))
        .and(body_json(json!({ "script": "typed by user" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(record_body("JSUtil", "typed by user")),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    let file = h.create("JSUtil.js", "typed by user");
    h.remember(&file, "function f(){}").await;

    h.engine.on_ready();
    // discovered while still empty, written to before the download lands
    assert_eq!(h.engine.on_add(&file, 0).await, Some(true));

    assert_eq!(std::fs::read_to_string(&file).unwrap(), "typed by user");
    assert_eq!(h.notifier.codes(), vec![NotifyCode::UploadComplete]);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test]
async fn missing_record_excludes_file_for_session() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/sys_script_include.do"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "records": [] })))
        .expect(1)
        .mount(&h.server)
        .await;
    let file = h.create("JSUtil.js", "");

    h.engine.on_ready();
    assert_eq!(h.engine.on_add(&file, 0).await, Some(false));
    assert_eq!(h.notifier.codes(), vec![NotifyCode::RecordNotFound]);

    std::fs::write(&file, "var a;").unwrap();
    assert_eq!(h.engine.on_change(&file, 6).await, None);
    assert_eq!(h.engine.on_change(&file, 0).await, None);
    assert_eq!(h.engine.on_add(&file, 0).await, None);
    assert!(!h.engine.add_file(&file).await.unwrap());
    assert_eq!(h.notifier.codes().len(), 1);
}

#[tokio::test]
async fn server_error_payload_is_sticky_but_outage_is_not() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(query_param("sysparm_query", "name=Denied"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "error": "Insufficient rights" })),
        )
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("sysparm_query", "name=Flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;
    let denied = h.create("Denied.js", "");
    let flaky = h.create("Flaky.js", "");

    assert!(!h.engine.add_file(&denied).await.unwrap());
    assert!(!h.engine.add_file(&flaky).await.unwrap());

    assert!(h.engine.track_file(&denied).unwrap().unwrap().has_errors());
    assert!(!h.engine.track_file(&flaky).unwrap().unwrap().has_errors());
    assert_eq!(
        h.notifier.codes(),
        vec![NotifyCode::ComplexError, NotifyCode::ComplexError]
    );
}

#[tokio::test]
async fn empty_field_is_received_with_warning() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "", 1).await;
    let file = h.file("JSUtil.js");

    assert!(h.engine.add_file(&file).await.unwrap());
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "");
    assert_eq!(h.stored(&file).await, fingerprint(b""));
    assert_eq!(h.notifier.codes(), vec![NotifyCode::ReceivedEmpty]);
}

#[tokio::test]
async fn record_without_field_is_sticky() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path("/sys_script_include.do"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "records": [{ "name": "JSUtil" }] })),
        )
        .mount(&h.server)
        .await;
    let file = h.file("JSUtil.js");

    assert!(!h.engine.add_file(&file).await.unwrap());
    assert!(h.engine.track_file(&file).unwrap().unwrap().has_errors());
    assert_eq!(h.notifier.codes(), vec![NotifyCode::ReceivedFileError]);
}

#[tokio::test]
async fn unsaved_fingerprint_is_a_serious_failure() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "function f(){}", 1).await;
    std::fs::write(h.dir.path().join(".sync_data"), b"not a directory").unwrap();
    let file = h.file("JSUtil.js");

    assert!(!h.engine.add_file(&file).await.unwrap());
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "function f(){}");
    assert_eq!(h.notifier.codes(), vec![NotifyCode::SyncStateError]);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test]
async fn concurrent_downloads_balance_queue_and_fold_notifications() {
    let h = Harness::new().await;
    for name in ["A", "B"] {
        Mock::given(method("GET"))
            .and(query_param("sysparm_query", format!("name={name}").as_str()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(record_body(name, "content"))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&h.server)
            .await;
    }
    for name in ["C", "D"] {
        Mock::given(method("GET"))
            .and(query_param("sysparm_query", format!("name={name}").as_str()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "records": [] }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&h.server)
            .await;
    }
    h.watcher.start().unwrap();

    let tasks: Vec<_> = ["A", "B", "C", "D"]
        .into_iter()
        .map(|name| {
            let engine = Arc::clone(&h.engine);
            let file = h.file(&format!("{name}.js"));
            tokio::spawn(async move { engine.add_file(&file).await.unwrap() })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.in_flight(), 4);
    assert!(!h.watcher.is_running());
    assert_eq!(h.watcher.stops(), 1);

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results.sort();
    assert_eq!(results, vec![false, false, true, true]);
    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(h.notifier.codes(), vec![NotifyCode::DownloadsFailed]);

    tokio::time::sleep(WATCH_RESTART_DELAY * 2).await;
    assert!(h.watcher.is_running());
    assert_eq!(h.watcher.starts(), 2);
}

#[tokio::test]
async fn successful_bulk_download_gets_one_summary() {
    let h = Harness::new().await;
    for name in ["A", "B", "C"] {
        Mock::given(method("GET"))
            .and(query_param("sysparm_query", format!("name={name}").as_str()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(record_body(name, name))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&h.server)
            .await;
    }

    let tasks: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|name| {
            let engine = Arc::clone(&h.engine);
            let file = h.file(&format!("{name}.js"));
            tokio::spawn(async move { engine.add_file(&file).await.unwrap() })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap());
    }

    assert_eq!(h.notifier.codes(), vec![NotifyCode::AllDownloadsComplete]);
}

#[tokio::test]
async fn watch_events_respect_readiness() {
    let h = Harness::new().await;
    mount_record(&h.server, "JSUtil", "function f(){}", 1).await;
    let file = h.create("JSUtil.js", "");

    let pending = h.engine.handle_watch_event(WatchEventKind::Add {
        path: file.clone(),
        size: 0,
    });
    assert!(pending.is_none());

    assert!(h.engine.handle_watch_event(WatchEventKind::Ready).is_none());
    assert!(h.engine.is_watcher_ready());

    let task = h
        .engine
        .handle_watch_event(WatchEventKind::Change {
            path: file.clone(),
            size: 0,
        })
        .unwrap();
    assert!(task.await.unwrap());
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "function f(){}");
    assert!(!h.engine.is_watcher_ready());
}

#[tokio::test]
async fn tracking_validates_and_reuses_records() {
    let h = Harness::new().await;
    let file = h.file("JSUtil.js");

    let first = h.engine.track_file(&file).unwrap().unwrap();
    let second = h.engine.track_file(&file).unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    assert!(h
        .engine
        .track_file(&h.dir.path().join("notes/readme.md"))
        .unwrap()
        .is_none());
    assert!(matches!(
        h.engine.track_file(Path::new("/not/a/root/script_includes/A.js")),
        Err(MappingError::NoRoot(_))
    ));
    assert!(h.engine.client_for(h.dir.path()).is_some());
}

async fn mount_slow_records(server: &MockServer, names: &[&str], delay: Duration) {
    for name in names {
        Mock::given(method("GET"))
            .and(query_param("sysparm_query", format!("name={name}").as_str()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(record_body(name, name))
                    .set_delay(delay),
            )
            .mount(server)
            .await;
    }
}

fn spawn_downloads(h: &Harness, names: &[&str]) -> Vec<JoinHandle<bool>> {
    names
        .iter()
        .map(|name| {
            let engine = Arc::clone(&h.engine);
            let file = h.file(&format!("{name}.js"));
            tokio::spawn(async move { engine.add_file(&file).await.unwrap() })
        })
        .collect()
}

#[tokio::test]
async fn rejected_upload_during_bulk_download_fails_the_batch() {
    let h = Harness::new().await;
    mount_slow_records(&h.server, &["A", "B", "C"], Duration::from_millis(600)).await;
    mount_record(&h.server, "JSUtil", "theirs", 2).await;
    forbid_requests(&h.server, "POST").await;
    let file = h.create("JSUtil.js", "mine");
    h.remember(&file, "base").await;

    let tasks = spawn_downloads(&h, &["A", "B", "C"]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.in_flight(), 3);

    // flagged at discovery, then filled in by the user before the download landed
    h.engine
        .track_file(&file)
        .unwrap()
        .unwrap()
        .mark_newly_discovered(true);
    assert!(!h.engine.add_file(&file).await.unwrap());
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "mine");

    for task in tasks {
        assert!(task.await.unwrap());
    }
    assert_eq!(h.engine.in_flight(), 0);
    assert_eq!(h.notifier.codes(), vec![NotifyCode::DownloadsFailed]);
}

#[tokio::test]
async fn non_utf8_content_is_never_uploaded() {
    let h = Harness::new().await;
    forbid_requests(&h.server, "GET").await;
    forbid_requests(&h.server, "POST").await;
    let file = h.file("JSUtil.js");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, [0xff, b'a']).unwrap();
    h.remember(&file, "base").await;

    assert!(!h.engine.send_file(&file).await.unwrap());
    assert_eq!(h.notifier.codes(), vec![NotifyCode::ComplexError]);
    assert_eq!(h.stored(&file).await, fingerprint(b"base"));
    assert!(!h.engine.track_file(&file).unwrap().unwrap().has_errors());

    let err = h.engine.read_text(&file).await.unwrap_err();
    assert!(matches!(err, EngineError::NotText(_)));
}

#[tokio::test]
async fn unsaved_fingerprint_fails_a_bulk_batch() {
    let h = Harness::new().await;
    mount_slow_records(&h.server, &["A", "B", "C"], Duration::from_millis(300)).await;
    std::fs::write(h.dir.path().join(".sync_data"), b"not a directory").unwrap();

    let mut results = Vec::new();
    for task in spawn_downloads(&h, &["A", "B", "C"]) {
        results.push(task.await.unwrap());
    }

    assert_eq!(results, vec![false, false, false]);
    assert_eq!(std::fs::read_to_string(h.file("A.js")).unwrap(), "A");
    assert_eq!(h.notifier.codes(), vec![NotifyCode::DownloadsFailed]);
}

#[tokio::test]
async fn watcher_stays_down_when_a_download_starts_before_restart() {
    let h = Harness::new().await;
    mount_record(&h.server, "A", "a", 1).await;
    mount_slow_records(&h.server, &["B"], Duration::from_millis(400)).await;
    h.watcher.start().unwrap();

    assert!(h.engine.add_file(&h.file("A.js")).await.unwrap());
    assert_eq!(h.watcher.stops(), 1);
    let tasks = spawn_downloads(&h, &["B"]);

    tokio::time::sleep(WATCH_RESTART_DELAY + Duration::from_millis(100)).await;
    assert_eq!(h.engine.in_flight(), 1);
    assert!(!h.watcher.is_running());
    assert_eq!(h.watcher.starts(), 1);

    for task in tasks {
        assert!(task.await.unwrap());
    }
    tokio::time::sleep(WATCH_RESTART_DELAY * 2).await;
    assert!(h.watcher.is_running());
    assert_eq!(h.watcher.starts(), 2);
}

#[tokio::test]
async fn refused_request_is_sticky_but_rate_limit_is_not() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(query_param("sysparm_query", "name=Locked"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(query_param("sysparm_query", "name=Busy"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&h.server)
        .await;
    let locked = h.file("Locked.js");
    let busy = h.file("Busy.js");

    assert!(!h.engine.add_file(&locked).await.unwrap());
    assert!(!h.engine.add_file(&busy).await.unwrap());

    assert!(h.engine.track_file(&locked).unwrap().unwrap().has_errors());
    assert!(!h.engine.track_file(&busy).unwrap().unwrap().has_errors());
}
