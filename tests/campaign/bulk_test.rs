//! Bulk and personalized campaigns run to completion.

use std::collections::HashMap;
use std::time::Duration;

use courier::campaign::{
    BulkOptions, CampaignOrchestrator, CampaignStatus, PersonalizedRecipient, RecipientStatus,
};
use courier::session::SessionState;
use courier::types::MessagePayload;
use courier::GatewayError;

use crate::support::{gateway, sid, wait_for_state, MockProvider};

fn text(body: &str) -> MessagePayload {
    MessagePayload::Text {
        text: body.to_owned(),
    }
}

fn no_delay() -> BulkOptions {
    BulkOptions {
        delay_between: Some(Duration::ZERO),
        ..BulkOptions::default()
    }
}

#[tokio::test]
async fn bulk_with_two_recipients_completes() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let ticket = gw
        .campaigns()
        .start_bulk(
            &id,
            vec!["15550001".to_owned(), "15550002".to_owned()],
            text("launch day"),
            no_delay(),
        )
        .await
        .expect("campaign should start");
    assert_eq!(ticket.total_recipients, 2);

    gw.campaigns().wait(&ticket.campaign_id).await;
    let campaign = gw
        .campaigns()
        .get_campaign(&ticket.campaign_id)
        .await
        .expect("campaign should exist");

    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.counts.total, 2);
    assert_eq!(campaign.counts.processed, 2);
    assert_eq!(campaign.counts.success + campaign.counts.failed, 2);
    assert!(campaign.ended_at.is_some());
    assert!(campaign
        .recipients
        .iter()
        .all(|r| r.status == RecipientStatus::Success && r.message_id.is_some()));
}

#[tokio::test]
async fn failures_are_counted_per_recipient() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    provider.fail_recipient("15550002@s.whatsapp.net");
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let recipients = vec![
        "15550001".to_owned(),
        "15550002".to_owned(),
        "not-a-phone".to_owned(),
    ];
    let ticket = gw
        .campaigns()
        .start_bulk(&id, recipients, text("hi"), no_delay())
        .await
        .expect("campaign should start");
    gw.campaigns().wait(&ticket.campaign_id).await;

    let campaign = gw
        .campaigns()
        .get_campaign(&ticket.campaign_id)
        .await
        .expect("campaign should exist");
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.counts.processed, 3);
    assert_eq!(campaign.counts.success, 1);
    assert_eq!(campaign.counts.failed, 2);
    assert_eq!(campaign.recipients[1].status, RecipientStatus::Failed);
    assert!(campaign.recipients[2]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("validation")));
}

#[tokio::test]
async fn personalized_bulk_renders_variables() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let recipients = vec![
        PersonalizedRecipient {
            recipient: "15550001".to_owned(),
            variables: HashMap::from([("name".to_owned(), "Ana".to_owned())]),
        },
        PersonalizedRecipient {
            recipient: "15550002".to_owned(),
            variables: HashMap::new(),
        },
    ];
    let ticket = gw
        .campaigns()
        .start_personalized_bulk(&id, recipients, text("Hi {{name}}!"), no_delay())
        .await
        .expect("campaign should start");
    gw.campaigns().wait(&ticket.campaign_id).await;

    let bodies: Vec<MessagePayload> = provider.sent().into_iter().map(|(_, p)| p).collect();
    assert_eq!(bodies, vec![text("Hi Ana!"), text("Hi {{name}}!")]);

    let campaign = gw
        .campaigns()
        .get_campaign(&ticket.campaign_id)
        .await
        .expect("campaign should exist");
    assert!(campaign.personalized);
    assert_eq!(campaign.message, text("Hi {{name}}!"));
}

#[tokio::test]
async fn duplicate_recipient_counts_as_success() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let ticket = gw
        .campaigns()
        .start_bulk(
            &id,
            vec!["15550001".to_owned(), "+1 5550001".to_owned()],
            text("once"),
            no_delay(),
        )
        .await
        .expect("campaign should start");
    gw.campaigns().wait(&ticket.campaign_id).await;

    let campaign = gw
        .campaigns()
        .get_campaign(&ticket.campaign_id)
        .await
        .expect("campaign should exist");
    assert_eq!(provider.sent().len(), 1);
    assert_eq!(campaign.counts.success, 2);
    assert_eq!(campaign.recipients[1].message_id, None);
}

#[tokio::test]
async fn rejects_invalid_campaigns() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());

    let empty = gw
        .campaigns()
        .start_bulk(&id, Vec::new(), text("x"), no_delay())
        .await;
    assert!(matches!(empty, Err(GatewayError::Validation(_))));

    let blank = gw
        .campaigns()
        .start_bulk(&id, vec!["1".to_owned()], text(""), no_delay())
        .await;
    assert!(matches!(blank, Err(GatewayError::Validation(_))));

    let unknown = gw
        .campaigns()
        .start_bulk(&sid("ghost"), vec!["1".to_owned()], text("x"), no_delay())
        .await;
    assert!(matches!(unknown, Err(GatewayError::NotFound { .. })));

    let missing = gw.campaigns().get_campaign("0000-not-there").await;
    assert!(matches!(
        missing,
        Err(GatewayError::NotFound { kind: "campaign", .. })
    ));
}

#[tokio::test]
async fn snapshots_outlive_the_orchestrator() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let mut ids = Vec::new();
    for body in ["first", "second"] {
        let ticket = gw
            .campaigns()
            .start_bulk(&id, vec!["15550001".to_owned()], text(body), no_delay())
            .await
            .expect("campaign should start");
        gw.campaigns().wait(&ticket.campaign_id).await;
        ids.push(ticket.campaign_id);
    }

    let fresh = CampaignOrchestrator::new(gw.queue().clone(), gw.store().clone(), Duration::ZERO);
    let restored = fresh
        .get_campaign(&ids[0])
        .await
        .expect("snapshot should load");
    assert_eq!(restored.status, CampaignStatus::Completed);
    assert_eq!(restored.message, text("first"));

    let listed = fresh.list_campaigns(&id).await;
    assert_eq!(listed.len(), 2);
    assert!(listed[0].started_at >= listed[1].started_at);
    assert!(fresh.list_campaigns(&sid("other")).await.is_empty());
}

#[tokio::test]
async fn finished_campaigns_are_released_from_memory() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let mut ids = Vec::new();
    for body in ["one", "two", "three"] {
        let ticket = gw
            .campaigns()
            .start_bulk(
                &id,
                vec!["15550001".to_owned(), "15550002".to_owned()],
                text(body),
                no_delay(),
            )
            .await
            .expect("campaign should start");
        gw.campaigns().wait(&ticket.campaign_id).await;
        ids.push(ticket.campaign_id);
    }

    for campaign_id in &ids {
        assert!(!gw.campaigns().is_tracking(campaign_id));
        let campaign = gw
            .campaigns()
            .get_campaign(campaign_id)
            .await
            .expect("snapshot should serve finished campaign");
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.counts.processed, 2);
    }
    assert_eq!(gw.campaigns().list_campaigns(&id).await.len(), 3);
}
