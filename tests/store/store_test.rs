//! Snapshot files: layout, corruption tolerance and id safety.

use std::collections::HashMap;

use chrono::Utc;

use courier::campaign::{
    Campaign, CampaignCounts, CampaignRecipient, CampaignStatus, RecipientStatus,
};
use courier::queue::{QueueItem, QueueSnapshot, QueueStats};
use courier::store::Store;
use courier::types::{MessageKind, MessagePayload, SessionId};

fn session(raw: &str) -> SessionId {
    match SessionId::parse(raw) {
        Ok(id) => id,
        Err(err) => panic!("session id should parse: {err}"),
    }
}

async fn open(dir: &std::path::Path) -> Store {
    match Store::open(dir).await {
        Ok(store) => store,
        Err(err) => panic!("store should open: {err}"),
    }
}

fn campaign(id: &str, session_id: &SessionId) -> Campaign {
    Campaign {
        id: id.to_owned(),
        session_id: session_id.clone(),
        kind: MessageKind::Text,
        message: MessagePayload::Text {
            text: "hello".to_owned(),
        },
        personalized: false,
        recipients: vec![CampaignRecipient {
            recipient: "15550001".to_owned(),
            variables: HashMap::new(),
            status: RecipientStatus::Pending,
            completed_at: None,
            message_id: None,
            error: None,
        }],
        counts: CampaignCounts {
            total: 1,
            ..CampaignCounts::default()
        },
        status: CampaignStatus::Processing,
        started_at: Utc::now(),
        ended_at: None,
        error: None,
    }
}

#[tokio::test]
async fn open_creates_layout() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = open(tmp.path()).await;
    assert!(store.queues_dir().is_dir());
    assert!(store.campaigns_dir().is_dir());
    assert!(store.queues_dir().starts_with(tmp.path()));
}

#[tokio::test]
async fn queue_snapshot_is_written_per_session() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = open(tmp.path()).await;
    let s1 = session("s1");

    let mut item = QueueItem::new(
        "1@s.whatsapp.net",
        MessagePayload::Text {
            text: "hi".to_owned(),
        },
        3,
    );
    item.seq = 7;
    let snapshot = QueueSnapshot {
        items: vec![item],
        stats: QueueStats {
            total: 8,
            success: 6,
            failed: 1,
        },
        last_processed: Some(Utc::now()),
        next_seq: 8,
    };
    assert!(store.save_queue(&s1, &snapshot).await.is_ok());

    assert!(store.queues_dir().join("s1.json").is_file());
    assert!(!store.queues_dir().join("s1.json.tmp").exists());
    assert_eq!(store.load_queue(&s1).await, Some(snapshot));
    assert_eq!(store.load_queue(&session("s2")).await, None);
}

#[tokio::test]
async fn corrupt_files_are_treated_as_absent() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = open(tmp.path()).await;
    let s1 = session("s1");

    assert!(std::fs::write(store.queues_dir().join("s1.json"), "[1, 2").is_ok());
    assert_eq!(store.load_queue(&s1).await, None);

    assert!(std::fs::write(store.campaigns_dir().join("abc-123.json"), "{}").is_ok());
    assert!(store.load_campaign("abc-123").await.is_none());
}

#[tokio::test]
async fn list_skips_unreadable_and_foreign_files() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = open(tmp.path()).await;
    let s1 = session("s1");

    assert!(store.save_campaign(&campaign("aaa-1", &s1)).await.is_ok());
    assert!(store.save_campaign(&campaign("bbb-2", &s1)).await.is_ok());
    assert!(std::fs::write(store.campaigns_dir().join("broken.json"), "nope").is_ok());
    assert!(std::fs::write(store.campaigns_dir().join("notes.txt"), "ignore").is_ok());

    let mut ids: Vec<String> = store
        .list_campaigns()
        .await
        .into_iter()
        .map(|c| c.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["aaa-1", "bbb-2"]);
}

#[tokio::test]
async fn unsafe_campaign_ids_never_touch_disk() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let store = open(tmp.path()).await;
    let s1 = session("s1");

    assert!(store.load_campaign("../queues/s1").await.is_none());
    assert!(store.load_campaign("").await.is_none());
    assert!(store
        .save_campaign(&campaign("../escape", &s1))
        .await
        .is_err());
    assert!(!tmp.path().join("escape.json").exists());
}
