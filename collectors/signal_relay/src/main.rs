use clap::Parser;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "signal_relay", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17700
    #[arg(long, default_value = "http://127.0.0.1:17700")]
    core_url: String,

    /// Report the user inactive after this many seconds without a
    /// `user_activity` line.
    #[arg(long, default_value_t = 30)]
    inactivity_seconds: u64,

    /// How often the inactivity watchdog checks (seconds).
    #[arg(long, default_value_t = 30)]
    inactivity_check_seconds: u64,

    /// Notification poll interval (seconds).
    #[arg(long, default_value_t = 5)]
    notify_poll_seconds: u64,

    /// Machine idle (no keyboard/mouse input) for >= this many seconds is
    /// reported as `idle_state_changed`. Windows only.
    #[arg(long, default_value_t = 5 * 60)]
    idle_cutoff_seconds: u64,

    /// Show notifications as Windows toasts instead of `notify` lines.
    ///
    /// Default is on; disable via `--toast=false`.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    toast: bool,
}

/// One line read from the host.
#[derive(Debug, PartialEq)]
enum Input {
    Blank,
    /// Keyboard, mouse or scroll seen in the page. Feeds the watchdog only.
    Activity,
    Signal(Value),
    Invalid(String),
}

fn classify_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Blank;
    }
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Input::Invalid(e.to_string()),
    };
    if !v.is_object() {
        return Input::Invalid("expected a JSON object".into());
    }
    match v.get("type").and_then(|t| t.as_str()) {
        Some("user_activity") => Input::Activity,
        Some(_) => Input::Signal(v),
        None => Input::Invalid("missing type".into()),
    }
}

/// Tracks the last page activity. Stays disarmed until the host reports
/// activity at least once.
#[derive(Debug)]
struct InactivityWatch {
    threshold: Duration,
    last_activity: Option<Instant>,
}

impl InactivityWatch {
    fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_activity: None,
        }
    }

    fn record(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    fn is_inactive(&self, now: Instant) -> bool {
        self.last_activity
            .is_some_and(|last| now.saturating_duration_since(last) > self.threshold)
    }
}

/// Requests from a signal acknowledgement that the host must carry out,
/// one JSON line each.
fn outbound_lines(ack: &Value) -> Vec<String> {
    ack.get("data")
        .and_then(|d| d.get("actions"))
        .and_then(|a| a.as_array())
        .map(|actions| actions.iter().map(|a| a.to_string()).collect())
        .unwrap_or_default()
}

fn notify_line(n: &Value) -> String {
    json!({ "notify": n }).to_string()
}

/// Position in the core's notification outbox.
///
/// Ids restart with every core process, so the cursor is only meaningful for
/// the `instance` it was taken from.
#[derive(Debug, Default)]
struct NotifyCursor {
    instance: Option<String>,
    after: u64,
}

impl NotifyCursor {
    fn query(&self) -> String {
        format!("notifications?after={}", self.after)
    }

    /// Notifications to deliver from one poll response. A response from a
    /// different core instance, or one whose latest id is behind the cursor,
    /// resets the cursor and yields nothing; the next poll re-reads from 0.
    fn advance(&mut self, body: &Value) -> Vec<Value> {
        let Some(data) = body.get("data") else {
            return Vec::new();
        };
        let instance = data.get("instance").and_then(|i| i.as_str());
        let latest = data.get("latest_id").and_then(|i| i.as_u64());
        let restarted = match (&self.instance, instance) {
            (Some(seen), Some(now)) => seen != now,
            _ => false,
        } || latest.is_some_and(|l| l < self.after);
        if let Some(now) = instance {
            self.instance = Some(now.to_string());
        }
        if restarted {
            self.after = 0;
            return Vec::new();
        }
        let items = data
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();
        for n in &items {
            if let Some(id) = n.get("id").and_then(|i| i.as_u64()) {
                self.after = self.after.max(id);
            }
        }
        items
    }
}

fn now_ts() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whether machine idle crossed the cutoff since the last check.
#[cfg(any(windows, test))]
fn idle_transition(was_idle: bool, idle_seconds: u64, cutoff_seconds: u64) -> Option<&'static str> {
    let idle = idle_seconds >= cutoff_seconds;
    match (was_idle, idle) {
        (false, true) => Some("idle"),
        (true, false) => Some("active"),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries outbound requests; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_relay=info".into()),
        )
        .init();

    let args = Args::parse();

    #[cfg(windows)]
    let _mutex = match ensure_single_instance_mutex() {
        Ok(g) => g,
        Err(e) => {
            tracing::info!("signal_relay already running; exit ({e})");
            return Ok(());
        }
    };

    relay::run(args).await
}

mod relay {
    use super::*;
    use reqwest::Client;
    use std::sync::Arc;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        sync::{mpsc, Mutex},
        time::interval,
    };
    use tracing::{debug, error, info, warn};

    #[derive(Clone)]
    struct Relay {
        client: Client,
        base_url: String,
        out: mpsc::UnboundedSender<String>,
    }

    impl Relay {
        async fn post_signal(&self, signal: &Value) -> anyhow::Result<Value> {
            let resp = self
                .client
                .post(format!("{}/signal", self.base_url))
                .json(signal)
                .send()
                .await?;
            let status = resp.status();
            let body: Value = resp.json().await?;
            if !status.is_success() {
                anyhow::bail!("core rejected signal ({status}): {body}");
            }
            Ok(body)
        }

        async fn forward(&self, signal: Value) {
            let kind = signal
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("?")
                .to_string();
            match self.post_signal(&signal).await {
                Ok(ack) => {
                    if ack.get("error").and_then(|e| e.as_str()) == Some("unrecognized_signal") {
                        warn!("core does not recognize signal {kind}");
                    }
                    for line in outbound_lines(&ack) {
                        let _ = self.out.send(line);
                    }
                }
                Err(e) => error!("post {kind} failed: {e}"),
            }
        }
    }

    pub(super) async fn run(args: Args) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let relay = Relay {
            client: Client::new(),
            base_url: args.core_url.trim_end_matches('/').to_string(),
            out: tx,
        };
        info!("signal relay started. Posting to {}/signal", relay.base_url);

        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = rx.recv().await {
                if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err()
                    || stdout.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let watch = Arc::new(Mutex::new(InactivityWatch::new(Duration::from_secs(
            args.inactivity_seconds,
        ))));

        tokio::spawn(watchdog(
            relay.clone(),
            watch.clone(),
            Duration::from_secs(args.inactivity_check_seconds.max(1)),
        ));
        tokio::spawn(poll_notifications(
            relay.clone(),
            Duration::from_secs(args.notify_poll_seconds.max(1)),
            args.toast,
        ));
        #[cfg(windows)]
        tokio::spawn(watch_system_idle(relay.clone(), args.idle_cutoff_seconds));
        #[cfg(not(windows))]
        debug!(
            "system idle detection unavailable; --idle-cutoff-seconds={} ignored",
            args.idle_cutoff_seconds
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            match classify_input(&line) {
                Input::Blank => {}
                Input::Activity => watch.lock().await.record(Instant::now()),
                Input::Signal(v) => relay.forward(v).await,
                Input::Invalid(e) => warn!("skipping input line: {e}"),
            }
        }
        info!("stdin closed; exiting");
        Ok(())
    }

    async fn watchdog(relay: Relay, watch: Arc<Mutex<InactivityWatch>>, every: Duration) {
        let mut ticker = interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if watch.lock().await.is_inactive(Instant::now()) {
                debug!("no page activity; reporting user_inactive");
                relay
                    .forward(json!({ "type": "user_inactive", "ts": now_ts() }))
                    .await;
            }
        }
    }

    async fn poll_notifications(relay: Relay, every: Duration, toast: bool) {
        let mut cursor = NotifyCursor::default();
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            let url = format!("{}/{}", relay.base_url, cursor.query());
            let body: Value = match relay.client.get(&url).send().await {
                Ok(resp) => match resp.json().await {
                    Ok(v) => v,
                    Err(e) => {
                        error!("bad notifications response: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    debug!("notifications poll failed: {e}");
                    continue;
                }
            };
            let before = cursor.after;
            let items = cursor.advance(&body);
            if cursor.after < before {
                info!("core restarted; re-reading notifications from the start");
            }
            for n in &items {
                deliver(&relay, n, toast);
            }
        }
    }

    fn deliver(relay: &Relay, n: &Value, toast: bool) {
        #[cfg(windows)]
        {
            if toast {
                use win_toast_notify::WinToastNotify;
                let title = n.get("title").and_then(|t| t.as_str()).unwrap_or_default();
                let body = n.get("body").and_then(|t| t.as_str()).unwrap_or_default();
                let _ = WinToastNotify::new()
                    .set_title(title)
                    .set_messages(vec![body])
                    .show();
                return;
            }
        }
        #[cfg(not(windows))]
        let _ = toast;
        let _ = relay.out.send(notify_line(n));
    }

    #[cfg(windows)]
    async fn watch_system_idle(relay: Relay, cutoff_seconds: u64) {
        let mut was_idle = false;
        let mut ticker = interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let idle_s = super::system_idle_seconds();
            if let Some(state) = idle_transition(was_idle, idle_s, cutoff_seconds) {
                was_idle = state == "idle";
                info!("system {state} (idle {idle_s}s)");
                relay
                    .forward(json!({ "type": "idle_state_changed", "state": state, "ts": now_ts() }))
                    .await;
            }
        }
    }
}

#[cfg(windows)]
struct MutexGuard(windows_sys::Win32::Foundation::HANDLE);

#[cfg(windows)]
impl Drop for MutexGuard {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.0);
        }
    }
}

/// A second relay would report every signal twice.
#[cfg(windows)]
fn ensure_single_instance_mutex() -> anyhow::Result<MutexGuard> {
    use std::ffi::c_void;
    use std::iter;
    use windows_sys::Win32::Foundation::{GetLastError, BOOL, ERROR_ALREADY_EXISTS, HANDLE};

    #[link(name = "kernel32")]
    extern "system" {
        fn CreateMutexW(
            lp_mutex_attributes: *const c_void,
            b_initial_owner: BOOL,
            lp_name: *const u16,
        ) -> HANDLE;
    }

    let name: Vec<u16> = "Local\\BrowserTimeTracker.signal_relay"
        .encode_utf16()
        .chain(iter::once(0))
        .collect();

    unsafe {
        let h = CreateMutexW(std::ptr::null(), 0, name.as_ptr());
        if h.is_null() {
            anyhow::bail!("CreateMutexW_failed");
        }
        if GetLastError() == ERROR_ALREADY_EXISTS {
            windows_sys::Win32::Foundation::CloseHandle(h);
            anyhow::bail!("already_exists");
        }
        Ok(MutexGuard(h))
    }
}

#[cfg(windows)]
fn system_idle_seconds() -> u64 {
    use windows_sys::Win32::System::SystemInformation::GetTickCount64;
    use windows_sys::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};

    unsafe {
        let mut lii = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };
        if GetLastInputInfo(&mut lii as *mut _) == 0 {
            return 0;
        }
        let now_low = (GetTickCount64() & 0xFFFF_FFFF) as u32;
        now_low.wrapping_sub(lii.dwTime) as u64 / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_host_lines() {
        assert_eq!(classify_input("   "), Input::Blank);
        assert_eq!(classify_input(r#"{"type":"user_activity"}"#), Input::Activity);
        assert!(matches!(
            classify_input(r#"{"type":"tab_activated","tab_id":1}"#),
            Input::Signal(_)
        ));
        assert!(matches!(classify_input("[1,2]"), Input::Invalid(_)));
        assert!(matches!(classify_input("{oops"), Input::Invalid(_)));
        assert!(matches!(classify_input(r#"{"tab_id":1}"#), Input::Invalid(_)));
    }

    #[test]
    fn watchdog_arms_on_first_activity() {
        let start = Instant::now();
        let mut w = InactivityWatch::new(Duration::from_secs(30));
        assert!(!w.is_inactive(start + Duration::from_secs(120)));

        w.record(start);
        assert!(!w.is_inactive(start + Duration::from_secs(30)));
        assert!(w.is_inactive(start + Duration::from_secs(31)));

        w.record(start + Duration::from_secs(40));
        assert!(!w.is_inactive(start + Duration::from_secs(60)));
    }

    #[test]
    fn actions_become_outbound_lines() {
        let ack = json!({
            "ok": true,
            "data": {
                "session": null,
                "actions": [{"navigate_tab": {"tab_id": 4, "url": "chrome-extension://x/focus-blocked.html"}}]
            }
        });
        let lines = outbound_lines(&ack);
        assert_eq!(lines.len(), 1);
        let v: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(v["navigate_tab"]["tab_id"], 4);

        assert!(outbound_lines(&json!({"ok": false, "error": "unrecognized_signal"})).is_empty());
    }

    #[test]
    fn notify_line_wraps_notification() {
        let v: Value =
            serde_json::from_str(&notify_line(&json!({"id": 1, "title": "t", "body": "b"}))).unwrap();
        assert_eq!(v["notify"]["title"], "t");
    }

    #[test]
    fn idle_transitions_fire_once_per_edge() {
        assert_eq!(idle_transition(false, 10, 300), None);
        assert_eq!(idle_transition(false, 300, 300), Some("idle"));
        assert_eq!(idle_transition(true, 900, 300), None);
        assert_eq!(idle_transition(true, 2, 300), Some("active"));
    }

    fn page(instance: &str, latest_id: u64, ids: &[u64]) -> Value {
        let items: Vec<Value> = ids.iter().map(|id| json!({"id": id, "title": "t"})).collect();
        json!({"ok": true, "data": {"instance": instance, "latest_id": latest_id, "items": items}})
    }

    #[test]
    fn notify_cursor_follows_ids() {
        let mut c = NotifyCursor::default();
        assert_eq!(c.query(), "notifications?after=0");
        assert_eq!(c.advance(&page("a", 3, &[1, 2, 3])).len(), 3);
        assert_eq!(c.query(), "notifications?after=3");
        assert!(c.advance(&page("a", 3, &[])).is_empty());
        assert_eq!(c.advance(&page("a", 4, &[4])).len(), 1);
        assert_eq!(c.after, 4);
    }

    #[test]
    fn notify_cursor_resets_when_core_restarts() {
        let mut c = NotifyCursor::default();
        c.advance(&page("a", 5, &[1, 2, 3, 4, 5]));
        assert_eq!(c.after, 5);

        // New core process: ids start again at 1 and the first poll with the
        // stale cursor returns nothing new.
        assert!(c.advance(&page("b", 2, &[])).is_empty());
        assert_eq!(c.query(), "notifications?after=0");
        let fresh = c.advance(&page("b", 2, &[1, 2]));
        assert_eq!(fresh.iter().map(|n| n["id"].as_u64()).collect::<Vec<_>>(), [Some(1), Some(2)]);
        assert_eq!(c.after, 2);
    }

    #[test]
    fn notify_cursor_resets_when_latest_id_is_behind() {
        let mut c = NotifyCursor {
            instance: None,
            after: 9,
        };
        assert!(c.advance(&json!({"ok": true, "data": {"latest_id": 1, "items": []}})).is_empty());
        assert_eq!(c.after, 0);
        assert!(c.advance(&json!({"ok": false, "error": "x"})).is_empty());
        assert_eq!(c.after, 0);
    }
}
