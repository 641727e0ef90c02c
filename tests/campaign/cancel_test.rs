//! Cooperative cancellation of running campaigns.

use std::time::Duration;

use courier::campaign::{BulkOptions, CampaignStatus, RecipientStatus};
use courier::session::SessionState;
use courier::types::MessagePayload;
use courier::GatewayError;

use crate::support::{eventually, gateway, sid, wait_for_state, MockProvider};

fn text(body: &str) -> MessagePayload {
    MessagePayload::Text {
        text: body.to_owned(),
    }
}

#[tokio::test]
async fn cancel_stops_before_next_recipient() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let slow = BulkOptions {
        delay_between: Some(Duration::from_millis(200)),
        ..BulkOptions::default()
    };
    let recipients = (1..=5).map(|n| format!("1555000{n}")).collect();
    let ticket = gw
        .campaigns()
        .start_bulk(&id, recipients, text("promo"), slow)
        .await
        .expect("campaign should start");

    eventually(|| provider.sent().len() == 1).await;
    let recorded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let progress = gw.campaigns().get_campaign(&ticket.campaign_id).await;
            if progress.is_ok_and(|c| c.counts.processed == 1) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(recorded.is_ok(), "first recipient was never recorded");

    let cancelled = gw.campaigns().cancel(&ticket.campaign_id).await;
    assert!(matches!(cancelled, Ok(true)));

    gw.campaigns().wait(&ticket.campaign_id).await;
    assert_eq!(provider.sent().len(), 1);
    assert!(!gw.campaigns().is_tracking(&ticket.campaign_id));

    let campaign = gw
        .campaigns()
        .get_campaign(&ticket.campaign_id)
        .await
        .expect("campaign should exist");
    assert_eq!(campaign.status, CampaignStatus::Cancelled);
    assert_eq!(campaign.counts.processed, 1);
    assert_eq!(
        campaign.counts.processed,
        campaign.counts.success + campaign.counts.failed
    );
    assert!(campaign.counts.processed <= campaign.counts.total);
    assert_eq!(campaign.recipients[4].status, RecipientStatus::Pending);

    let on_disk = gw
        .store()
        .load_campaign(&ticket.campaign_id)
        .await
        .expect("snapshot should exist");
    assert_eq!(on_disk.status, CampaignStatus::Cancelled);
}

#[tokio::test]
async fn finished_campaign_cannot_be_cancelled() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::auto_open();
    let gw = gateway(tmp.path(), &provider).await;
    let id = sid("s1");
    assert!(gw.connect(&id).await.is_ok());
    wait_for_state(gw.sessions(), &id, SessionState::Open).await;

    let options = BulkOptions {
        delay_between: Some(Duration::ZERO),
        ..BulkOptions::default()
    };
    let ticket = gw
        .campaigns()
        .start_bulk(&id, vec!["15550001".to_owned()], text("x"), options)
        .await
        .expect("campaign should start");
    gw.campaigns().wait(&ticket.campaign_id).await;

    assert!(matches!(
        gw.campaigns().cancel(&ticket.campaign_id).await,
        Ok(false)
    ));
    let campaign = gw
        .campaigns()
        .get_campaign(&ticket.campaign_id)
        .await
        .expect("campaign should exist");
    assert_eq!(campaign.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn cancel_unknown_campaign_is_not_found() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let provider = MockProvider::manual();
    let gw = gateway(tmp.path(), &provider).await;

    let result = gw.campaigns().cancel("nope").await;
    assert!(matches!(
        result,
        Err(GatewayError::NotFound { kind: "campaign", .. })
    ));
}
