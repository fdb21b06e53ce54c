//! Helper-process radio driver
//!
//! Runs an external helper that wraps the vendor radio library and talks
//! newline-delimited JSON over its standard streams:
//!
//! ```text
//! gateway -> helper (stdin)            helper -> gateway (stdout)
//! {"command":"send_text",...}          {"event":"connected"}
//! {"command":"traceroute",...}         {"event":"my_info","my_node_num":42}
//! {"command":"close"}                  {"event":"channels","channels":[...]}
//!                                      {"event":"config","config":{...}}
//!                                      {"event":"node_updated","node":{...}}
//!                                      {"event":"packet","packet":{...}}
//!                                      {"event":"connection_lost"}
//!                                      {"event":"error","message":"..."}
//! ```
//!
//! The helper is started as `<helper_command> <helper_args..> <mode> <address>`.
//! `open` returns once `connected` arrives; `my_info` may follow later and
//! is passed on to listeners when it does.
//! Its stdout is read on a dedicated thread, which is the thread all
//! listener callbacks run on.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::{
    ChannelInfo, LinkListener, LinkTarget, OutgoingText, RadioDriver, RadioLink,
    SubscriptionId, TracerouteRequest,
};
use crate::config::DriverConfig;
use crate::error::{GatewayError, Result};
use crate::packet::RawValue;

/// How long a closing helper gets before it is killed
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Listeners = Arc<RwLock<HashMap<u64, Arc<dyn LinkListener>>>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HelperEvent {
    Connected,
    ConnectionLost,
    MyInfo { my_node_num: u32 },
    Channels { channels: Vec<ChannelInfo> },
    Config { config: Value },
    NodeUpdated { node: Value },
    Packet { packet: Value },
    Error { message: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum HelperCommand<'a> {
    SendText(&'a OutgoingText),
    Traceroute(&'a TracerouteRequest),
    Close,
}

/// Node database and device info learned from the helper
#[derive(Debug, Default)]
struct LinkState {
    my_node_num: Option<u32>,
    channels: Vec<ChannelInfo>,
    config: Option<Value>,
    nodes: BTreeMap<String, Value>,
}

impl LinkState {
    fn upsert_node(&mut self, node: &Value) {
        let key = node
            .get("num")
            .and_then(Value::as_u64)
            .map(|n| n.to_string())
            .or_else(|| {
                node.get("user")
                    .and_then(|u| u.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        match key {
            Some(key) => {
                self.nodes.insert(key, node.clone());
            }
            None => debug!("Ignoring node update without num or id"),
        }
    }
}

/// Driver backed by a helper process
pub struct ProcessDriver {
    config: DriverConfig,
    connect_timeout: Duration,
    listeners: Listeners,
    next_id: AtomicU64,
}

impl ProcessDriver {
    /// Create a driver for the configured helper
    pub fn new(config: DriverConfig, connect_timeout: Duration) -> Self {
        Self {
            config,
            connect_timeout,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn spawn_helper(&self, target: &LinkTarget) -> Result<Child> {
        let mut command = Command::new(&self.config.helper_command);
        command
            .args(&self.config.helper_args)
            .arg(target.connection_type().as_str())
            .arg(target.address())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        command.spawn().map_err(|e| GatewayError::OpenFailed {
            target: target.to_string(),
            reason: format!("failed to start {}: {}", self.config.helper_command, e),
        })
    }
}

impl RadioDriver for ProcessDriver {
    fn subscribe(&self, listener: Arc<dyn LinkListener>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, listener);
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.write().remove(&id.0);
    }

    fn open(&self, target: &LinkTarget) -> Result<Box<dyn RadioLink>> {
        let mut child = self.spawn_helper(target)?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(GatewayError::OpenFailed {
                    target: target.to_string(),
                    reason: "helper streams unavailable".to_string(),
                });
            }
        };

        let state = Arc::new(Mutex::new(LinkState::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let reader = HelperReader {
            listeners: self.listeners.clone(),
            state: state.clone(),
            closed: closed.clone(),
            ready: Some(ready_tx),
        };
        let spawned = thread::Builder::new()
            .name("meshgate-driver".to_string())
            .spawn(move || reader.run(stdout));
        if let Err(e) = spawned {
            let _ = child.kill();
            return Err(GatewayError::Io(e));
        }

        let outcome = match ready_rx.recv_timeout(self.connect_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(GatewayError::OpenFailed {
                target: target.to_string(),
                reason,
            }),
            Err(RecvTimeoutError::Timeout) => Err(GatewayError::ConnectionTimeout {
                duration_ms: self.connect_timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(GatewayError::OpenFailed {
                target: target.to_string(),
                reason: "helper reader stopped".to_string(),
            }),
        };

        if let Err(e) = outcome {
            closed.store(true, Ordering::SeqCst);
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        info!(link = %target, "Helper link open");
        Ok(Box::new(ProcessLink {
            child,
            stdin,
            state,
            closed,
        }))
    }

    fn name(&self) -> &str {
        &self.config.helper_command
    }
}

/// Reads helper stdout and fans events out to listeners
struct HelperReader {
    listeners: Listeners,
    state: Arc<Mutex<LinkState>>,
    closed: Arc<AtomicBool>,
    ready: Option<SyncSender<std::result::Result<(), String>>>,
}

impl HelperReader {
    fn run(mut self, stdout: ChildStdout) {
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Helper read error: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HelperEvent>(&line) {
                Ok(event) => self.handle(event),
                Err(e) => warn!(error = %e, "Dropping unreadable helper line"),
            }
        }

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err("helper exited before connecting".to_string()));
        } else if !self.closed.load(Ordering::SeqCst) {
            warn!("Helper exited unexpectedly");
            self.each_listener(|l| l.on_connection_lost());
        }
        debug!("Helper reader finished");
    }

    fn handle(&mut self, event: HelperEvent) {
        trace!(?event, "Helper event");
        match event {
            HelperEvent::Connected => {
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
                self.each_listener(|l| l.on_connection_established());
            }
            HelperEvent::ConnectionLost => {
                if !self.closed.load(Ordering::SeqCst) {
                    self.each_listener(|l| l.on_connection_lost());
                }
            }
            HelperEvent::MyInfo { my_node_num } => {
                self.state.lock().my_node_num = Some(my_node_num);
                self.each_listener(|l| l.on_my_info(my_node_num));
            }
            HelperEvent::Channels { channels } => {
                self.state.lock().channels = channels;
            }
            HelperEvent::Config { config } => {
                self.state.lock().config = Some(config);
            }
            HelperEvent::NodeUpdated { node } => {
                self.state.lock().upsert_node(&node);
                let raw = RawValue::Plain(node);
                self.each_listener(|l| l.on_node_updated(raw.clone()));
            }
            HelperEvent::Packet { packet } => {
                let raw = RawValue::Plain(packet);
                self.each_listener(|l| l.on_packet(raw.clone()));
            }
            HelperEvent::Error { message } => match self.ready.take() {
                Some(ready) => {
                    let _ = ready.send(Err(message));
                }
                None => warn!(%message, "Helper reported an error"),
            },
        }
    }

    fn each_listener(&self, f: impl Fn(&dyn LinkListener)) {
        let listeners: Vec<_> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            f(listener.as_ref());
        }
    }
}

/// Link to a running helper process
struct ProcessLink {
    child: Child,
    stdin: ChildStdin,
    state: Arc<Mutex<LinkState>>,
    closed: Arc<AtomicBool>,
}

impl ProcessLink {
    fn write_command(&mut self, command: &HelperCommand<'_>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }
        self.write_line(command)
    }

    fn write_line(&mut self, command: &HelperCommand<'_>) -> Result<()> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| GatewayError::Link(e.to_string()))
    }
}

impl RadioLink for ProcessLink {
    fn my_node_num(&self) -> Option<u32> {
        self.state.lock().my_node_num
    }

    fn nodes(&self) -> Vec<RawValue> {
        self.state
            .lock()
            .nodes
            .values()
            .cloned()
            .map(RawValue::Plain)
            .collect()
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.state.lock().channels.clone()
    }

    fn config(&self) -> Value {
        self.state
            .lock()
            .config
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    fn send_text(&mut self, message: &OutgoingText) -> Result<()> {
        self.write_command(&HelperCommand::SendText(message))
    }

    fn send_traceroute(&mut self, request: &TracerouteRequest) -> Result<()> {
        self.write_command(&HelperCommand::Traceroute(request))
    }

    fn close(&mut self) -> Result<()> {
        // Marked first so the helper's exit is not reported as a loss
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.write_line(&HelperCommand::Close) {
            debug!("Close command not delivered: {}", e);
        }

        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            match self.child.try_wait()? {
                Some(status) => {
                    debug!(%status, "Helper exited");
                    return Ok(());
                }
                None if Instant::now() >= deadline => {
                    warn!("Helper did not exit in time, killing it");
                    self.child.kill()?;
                    self.child.wait()?;
                    return Ok(());
                }
                None => thread::sleep(Duration::from_millis(20)),
            }
        }
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_helper_event_parsing() {
        let event: HelperEvent =
            serde_json::from_str(r#"{"event":"my_info","my_node_num":42}"#).unwrap();
        assert!(matches!(event, HelperEvent::MyInfo { my_node_num: 42 }));

        let event: HelperEvent = serde_json::from_str(
            r#"{"event":"channels","channels":[{"index":0,"name":"LongFast","role":1},{"index":1}]}"#,
        )
        .unwrap();
        match event {
            HelperEvent::Channels { channels } => {
                assert_eq!(channels.len(), 2);
                assert_eq!(channels[1].role, 0);
                assert!(channels[1].name.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_helper_command_serialization() {
        let message = OutgoingText {
            packet_id: 7,
            text: "hi".into(),
            destination: "^all".into(),
            channel_index: 0,
            want_ack: true,
            reply_id: None,
        };
        let value = serde_json::to_value(HelperCommand::SendText(&message)).unwrap();
        assert_eq!(value["command"], "send_text");
        assert_eq!(value["packet_id"], 7);
        assert_eq!(value["want_ack"], true);

        let value = serde_json::to_value(HelperCommand::Close).unwrap();
        assert_eq!(value, json!({"command": "close"}));
    }

    #[test]
    fn test_link_state_upsert() {
        let mut state = LinkState::default();
        state.upsert_node(&json!({"num": 1, "snr": 1.0}));
        state.upsert_node(&json!({"num": 1, "snr": 2.0}));
        state.upsert_node(&json!({"user": {"id": "!00000002"}}));
        state.upsert_node(&json!({"snr": 3.0}));
        assert_eq!(state.nodes.len(), 2);
        assert_eq!(state.nodes["1"]["snr"], 2.0);
    }

    /// Reads commands until `close` arrives
    const AWAIT_CLOSE: &str = r#"while read line; do case "$line" in *close*) exit 0;; esac; done"#;

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }

        fn wait_for(&self, what: &str) -> bool {
            for _ in 0..150 {
                if self.seen.lock().iter().any(|s| s == what) {
                    return true;
                }
                thread::sleep(Duration::from_millis(20));
            }
            false
        }
    }

    impl LinkListener for RecordingListener {
        fn on_packet(&self, _packet: RawValue) {
            self.seen.lock().push("packet".to_string());
        }

        fn on_connection_established(&self) {
            self.seen.lock().push("established".to_string());
        }

        fn on_connection_lost(&self) {
            self.seen.lock().push("lost".to_string());
        }

        fn on_node_updated(&self, _node: RawValue) {
            self.seen.lock().push("node".to_string());
        }

        fn on_my_info(&self, my_node_num: u32) {
            self.seen.lock().push(format!("my_info:{}", my_node_num));
        }
    }

    fn sh_driver(script: &str, connect_timeout_ms: u64) -> ProcessDriver {
        let config = DriverConfig {
            helper_command: "sh".to_string(),
            helper_args: vec!["-c".to_string(), script.to_string(), "helper".to_string()],
        };
        ProcessDriver::new(config, Duration::from_millis(connect_timeout_ms))
    }

    fn serial_target() -> LinkTarget {
        LinkTarget::Serial {
            path: "/dev/ttyUSB0".into(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_open_against_helper_and_late_my_info() {
        let script = format!(
            r#"echo '{{"event":"connected"}}'
echo '{{"event":"channels","channels":[{{"index":0,"role":1}}]}}'
echo '{{"event":"config","config":{{"localConfig":{{"lora":{{"region":"EU_868"}}}}}}}}'
echo '{{"event":"packet","packet":{{"from":1}}}}'
sleep 0.05
echo '{{"event":"my_info","my_node_num":66}}'
{}"#,
            AWAIT_CLOSE
        );
        let driver = sh_driver(&script, 2000);
        let listener = Arc::new(RecordingListener::default());
        driver.subscribe(listener.clone());

        let mut link = driver.open(&serial_target()).unwrap();
        assert!(listener.wait_for("my_info:66"));
        assert_eq!(link.my_node_num(), Some(66));
        assert_eq!(link.channels().len(), 1);
        assert_eq!(link.config()["localConfig"]["lora"]["region"], "EU_868");
        assert_eq!(
            listener.seen(),
            vec!["established", "packet", "my_info:66"]
        );

        let message = OutgoingText {
            packet_id: 9,
            text: "hi".into(),
            destination: "^all".into(),
            channel_index: 0,
            want_ack: true,
            reply_id: None,
        };
        link.send_text(&message).unwrap();
        link.close().unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(!listener.seen().contains(&"lost".to_string()));
        assert!(matches!(link.send_text(&message), Err(GatewayError::NotConnected)));
    }

    #[cfg(unix)]
    #[test]
    fn test_config_is_empty_until_reported() {
        let script = format!(r#"echo '{{"event":"connected"}}'; {}"#, AWAIT_CLOSE);
        let driver = sh_driver(&script, 2000);
        let mut link = driver.open(&serial_target()).unwrap();
        assert_eq!(link.config(), json!({}));
        assert_eq!(link.my_node_num(), None);
        link.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_error_event_fails_open() {
        let driver = sh_driver(
            r#"echo '{"event":"error","message":"no device on port"}'; exec sleep 30"#,
            2000,
        );
        match driver.open(&serial_target()) {
            Err(GatewayError::OpenFailed { reason, .. }) => {
                assert_eq!(reason, "no device on port");
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("open should fail"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_exit_before_connect_fails_open() {
        let driver = sh_driver("exit 3", 2000);
        match driver.open(&serial_target()) {
            Err(GatewayError::OpenFailed { reason, .. }) => {
                assert_eq!(reason, "helper exited before connecting");
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("open should fail"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_silent_helper_times_out() {
        let driver = sh_driver("exec sleep 30", 200);
        assert!(matches!(
            driver.open(&serial_target()),
            Err(GatewayError::ConnectionTimeout { duration_ms: 200 })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_exit_after_open_reports_loss() {
        let driver = sh_driver(r#"echo '{"event":"connected"}'; sleep 0.1"#, 2000);
        let listener = Arc::new(RecordingListener::default());
        driver.subscribe(listener.clone());

        let _link = driver.open(&serial_target()).unwrap();
        assert!(listener.wait_for("lost"));
        assert_eq!(listener.seen(), vec!["established", "lost"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_close_kills_unresponsive_helper() {
        let driver = sh_driver(r#"echo '{"event":"connected"}'; exec sleep 30"#, 2000);
        let listener = Arc::new(RecordingListener::default());
        driver.subscribe(listener.clone());

        let mut link = driver.open(&serial_target()).unwrap();
        let started = Instant::now();
        link.close().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= CLOSE_GRACE);
        assert!(elapsed < Duration::from_secs(10));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(listener.seen(), vec!["established"]);
    }

    #[test]
    fn test_open_fails_for_missing_helper() {
        let config = DriverConfig {
            helper_command: "/nonexistent/meshgate-helper".to_string(),
            helper_args: Vec::new(),
        };
        let driver = ProcessDriver::new(config, Duration::from_millis(200));
        let target = LinkTarget::Serial {
            path: "/dev/null".into(),
        };

        match driver.open(&target) {
            Err(GatewayError::OpenFailed { target, .. }) => {
                assert_eq!(target, "serial:///dev/null");
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("open should fail"),
        }
    }
}
