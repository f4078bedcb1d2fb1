use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use futures_util::future::{BoxFuture, FutureExt};
use linetrip::{
    ActionError, CommandRunner, ConfigFile, ConfigSource, Dispatcher, EngineOptions,
    EngineState, FileRegistry, Message, NotificationSettings, Notifier, TailOptions,
    WatchManager,
};
use parking_lot::Mutex;
use tempfile::TempDir;

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Message>>,
    ran: Mutex<Vec<String>>,
}

impl Notifier for Recorder {
    fn send<'a>(
        &'a self,
        _settings: &'a NotificationSettings,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), ActionError>> {
        self.sent.lock().push(message.clone());
        async { Ok(()) }.boxed()
    }
}

impl CommandRunner for Recorder {
    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<(), ActionError>> {
        self.ran.lock().push(command.to_string());
        async { Ok(()) }.boxed()
    }
}

struct Engine {
    root: TempDir,
    logs: PathBuf,
    config: PathBuf,
    recorder: Arc<Recorder>,
    manager: WatchManager,
}

fn config_text(logs: &Path, trigger: &str, command: &str) -> String {
    format!(
        r#"
        [notification]
        from = "scanner@example.com"

        [[profiles]]
        file_name_pattern = "app"
        log_directory = {:?}
        trigger = "{}"

        [profiles.action]
        send_notification = true
        run_command = true
        command = "{}"

        [profiles.notification]
        subject = "trigger seen"
        recipients = ["ops@example.com"]
        "#,
        logs.to_string_lossy(),
        trigger,
        command
    )
}

fn engine(trigger: &str, command: &str) -> Engine {
    let root = tempfile::tempdir().unwrap();
    let logs = root.path().join("logs");
    let etc = root.path().join("etc");
    fs::create_dir(&logs).unwrap();
    fs::create_dir(&etc).unwrap();
    let logs = logs.canonicalize().unwrap();

    let config = etc.join("linetrip.toml");
    fs::write(&config, config_text(&logs, trigger, command)).unwrap();

    let source = Arc::new(ConfigFile::new(&config));
    let recorder = Arc::new(Recorder::default());
    let dispatcher = Dispatcher::new(recorder.clone(), recorder.clone()).with_host("testhost");

    let options = EngineOptions {
        reload_grace: Duration::from_millis(20),
        tail: TailOptions {
            retry_delay: Duration::from_millis(20),
            max_idle_polls: 500,
        },
    };
    let manager = WatchManager::new(
        source.clone(),
        Arc::new(dispatcher),
        FileRegistry::new(),
        options,
    );
    manager.start(source.load_validated().unwrap()).unwrap();

    Engine {
        root,
        logs,
        config,
        recorder,
        manager,
    }
}

impl Engine {
    fn ran(&self) -> Vec<String> {
        self.recorder.ran.lock().clone()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// Swaps the file in one step so the watcher never sees a half-written config
fn replace_config(path: &Path, text: &str) {
    let staged = path.with_extension("toml.new");
    fs::write(&staged, text).unwrap();
    fs::rename(&staged, path).unwrap();
}

fn append(path: &Path, text: &str) {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap()
        .write_all(text.as_bytes())
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_detects_trigger_once() {
    let engine = engine("trigger-X", "alert.sh");
    let file = engine.logs.join("app.log");
    let contents = "AAA\ntrigger-X appears here\nBBB\n";

    fs::write(&file, contents).unwrap();

    assert!(wait_until(|| !engine.ran().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(engine.ran(), vec!["alert.sh".to_string()]);
    let sent = engine.recorder.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].body,
        "The string \"trigger-X\" was detected.\nserver: testhost\nfile: app.log"
    );

    let registry = engine.manager.registry();
    assert!(wait_until(|| registry.get("app.log").map_or(false, |s| !s.is_active)).await);
    let state = registry.get("app.log").unwrap();
    assert!(state.triggers_found.contains("trigger-X"));

    // Writing the trigger again does not fire again
    append(&file, "trigger-X once more\n");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.ran().len(), 1);

    engine.manager.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ignores_unreferenced_files() {
    let engine = engine("trigger-X", "alert.sh");

    fs::write(engine.logs.join("other.txt"), "trigger-X\n").unwrap();
    fs::write(engine.logs.join("app.log"), "nothing\n").unwrap();

    let registry = engine.manager.registry();
    assert!(wait_until(|| registry.contains("app.log")).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!registry.contains("other.txt"));
    assert!(engine.ran().is_empty());

    engine.manager.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resumes_from_offset_on_append() {
    let engine = engine("trigger-X", "alert.sh");
    let file = engine.logs.join("app.log");
    let registry = engine.manager.registry();

    fs::write(&file, "AAA\n").unwrap();
    assert!(
        wait_until(|| registry
            .get("app.log")
            .map_or(false, |s| !s.is_active && s.read_offset == 4))
        .await
    );

    append(&file, "BBB trigger-X\n");

    assert!(wait_until(|| engine.ran().len() == 1).await);
    assert!(
        wait_until(|| registry
            .get("app.log")
            .map_or(false, |s| !s.is_active && s.read_offset == 18))
        .await
    );

    engine.manager.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deletion_removes_entry() {
    let engine = engine("trigger-X", "alert.sh");
    let file = engine.logs.join("app.log");
    let registry = engine.manager.registry();

    fs::write(&file, "AAA\n").unwrap();
    assert!(wait_until(|| registry.get("app.log").map_or(false, |s| !s.is_active)).await);

    fs::remove_file(&file).unwrap();
    assert!(wait_until(|| !registry.contains("app.log")).await);

    // A file reappearing under the same name starts over
    fs::write(&file, "trigger-X\n").unwrap();
    assert!(wait_until(|| engine.ran().len() == 1).await);

    engine.manager.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_cancels_and_restarts() {
    let engine = engine("OLDTRIG", "old.sh");
    let registry = engine.manager.registry();
    assert_eq!(engine.manager.generation(), 0);

    // Hold the file as a writer would, so its tail waits for data
    let staging = engine.root.path().join("staging.log");
    let writer = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&staging)
        .unwrap();
    writer.lock_exclusive().unwrap();

    let file = engine.logs.join("app.log");
    fs::rename(&staging, &file).unwrap();
    assert!(wait_until(|| registry.get("app.log").map_or(false, |s| s.is_active)).await);

    replace_config(&engine.config, &config_text(&engine.logs, "NEWTRIG", "new.sh"));

    assert!(wait_until(|| engine.manager.generation() == 1).await);
    assert!(wait_until(|| registry.get("app.log").map_or(false, |s| !s.is_active)).await);
    assert!(wait_until(|| engine.manager.state() == EngineState::Running).await);

    writer.unlock().unwrap();
    drop(writer);

    append(&file, "OLDTRIG and NEWTRIG\n");

    assert!(wait_until(|| !engine.ran().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.ran(), vec!["new.sh".to_string()]);

    engine.manager.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_reload_stops_engine() {
    let engine = engine("trigger-X", "alert.sh");
    let mut state = engine.manager.subscribe();
    assert_eq!(*state.borrow(), EngineState::Running);

    replace_config(&engine.config, "profiles = []\n");

    let stopped = tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == EngineState::Stopped),
    )
    .await;
    assert!(stopped.is_ok());

    // Stopped engines watch nothing
    fs::write(engine.logs.join("app.log"), "trigger-X\n").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.ran().is_empty());
    assert!(!engine.manager.registry().contains("app.log"));
}
