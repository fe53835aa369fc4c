use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info};

const OUTBOX_CAPACITY: usize = 200;

static INSTANCES: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub created_at: String,
}

/// One poll of the outbox.
///
/// Ids restart at 1 with every process, so a poller holding a cursor from an
/// earlier `instance` must start over from 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NotificationPage {
    pub instance: String,
    pub latest_id: u64,
    pub items: Vec<Notification>,
}

#[derive(Default)]
struct Outbox {
    next_id: u64,
    items: VecDeque<Notification>,
}

/// Bounded queue of raised notifications. Whoever displays them polls with
/// the last id it has seen.
#[derive(Clone)]
pub struct Notifier {
    instance: Arc<str>,
    outbox: Arc<Mutex<Outbox>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let started = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let seq = INSTANCES.fetch_add(1, Ordering::Relaxed);
        Self {
            instance: format!("{started:x}-{seq}").into(),
            outbox: Arc::default(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Queues a notification unless the user turned notifications off.
    pub async fn raise(&self, enabled: bool, title: &str, body: &str) -> Option<Notification> {
        if !enabled {
            debug!("notification suppressed: {title}");
            return None;
        }
        let mut outbox = self.outbox.lock().await;
        outbox.next_id += 1;
        let n = Notification {
            id: outbox.next_id,
            title: title.to_string(),
            body: body.to_string(),
            created_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        };
        if outbox.items.len() >= OUTBOX_CAPACITY {
            outbox.items.pop_front();
        }
        outbox.items.push_back(n.clone());
        info!("notification #{}: {} | {}", n.id, n.title, n.body);
        Some(n)
    }

    pub async fn since(&self, after: u64, limit: usize) -> Vec<Notification> {
        self.page(after, limit).await.items
    }

    pub async fn page(&self, after: u64, limit: usize) -> NotificationPage {
        let outbox = self.outbox.lock().await;
        NotificationPage {
            instance: self.instance.to_string(),
            latest_id: outbox.next_id,
            items: outbox
                .items
                .iter()
                .filter(|n| n.id > after)
                .take(limit)
                .cloned()
                .collect(),
        }
    }
}
