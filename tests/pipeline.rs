use std::sync::Arc;

use anyhow::Result;
use sqlbot::dispatch::{DispatchChannel, Dispatcher, queue};
use sqlbot::inbound::InboundRequest;
use sqlbot::receiver::{CommandReceiver, Outcome};
use sqlbot::table::Row;
use sqlbot::testing::{ManualClock, RecordingPublisher, ScriptedConnector, sample_registry};
use sqlbot::worker::QueryWorker;

fn slash_body(alias: &str, trigger: &str) -> String {
    format!("trigger_id={trigger}&command=%2Fsql&text={alias}&user_name=alice&channel_id=C77")
}

#[tokio::test]
async fn request_flows_from_receiver_to_publisher() -> Result<()> {
    let (channel, rx) = queue(8);
    let connector =
        ScriptedConnector::returning(vec![vec![Row::new().with("total", Some("3"))]]);
    let publisher = RecordingPublisher::new();
    let worker = QueryWorker::new(Arc::new(connector.clone()), Arc::new(publisher.clone()))
        .with_clock(Arc::new(ManualClock::new()));
    let worker_task = tokio::spawn(async move { worker.run(rx).await });

    let receiver = CommandReceiver::new(
        sample_registry(),
        Dispatcher::new(Arc::new(channel), "sqlbot-worker"),
    );
    let first = receiver
        .handle(&InboundRequest::new(slash_body("users", "t-1")))
        .await?;
    let unknown = receiver
        .handle(&InboundRequest::new(slash_body("nope", "t-2")))
        .await?;
    let second = receiver
        .handle(&InboundRequest::new(slash_body("users", "t-3")))
        .await?;
    assert_eq!(first.outcome, Outcome::Dispatched);
    assert_eq!(unknown.outcome, Outcome::AliasNotFound);
    assert_eq!(second.outcome, Outcome::Dispatched);

    drop(receiver);
    let stats = worker_task.await?;
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.publish_failures, 0);
    assert_eq!(stats.rejected_payloads, 0);

    let published = publisher.published();
    let ids: Vec<&str> = published.iter().map(|p| p.correlation_id.as_str()).collect();
    assert_eq!(ids, vec!["t-1", "t-3"]);
    assert!(published.iter().all(|p| p.location == "C77"));
    assert_eq!(published[0].content, "total\n-----\n3    ");
    assert_eq!(connector.closed(), 2);
    Ok(())
}

#[tokio::test]
async fn worker_survives_bad_payloads_and_publish_errors() -> Result<()> {
    let (channel, rx) = queue(4);
    let connector = ScriptedConnector::returning(Vec::new());
    let publisher = RecordingPublisher::failing("not_in_channel");
    let worker = QueryWorker::new(Arc::new(connector), Arc::new(publisher))
        .with_clock(Arc::new(ManualClock::new()));

    channel.send("sqlbot-worker", b"{not json".to_vec()).await?;
    let receiver = CommandReceiver::new(
        sample_registry(),
        Dispatcher::new(Arc::new(channel), "sqlbot-worker"),
    );
    receiver
        .handle(&InboundRequest::new(slash_body("users", "t-9")))
        .await?;
    drop(receiver);

    let stats = worker.run(rx).await;
    assert_eq!(stats.rejected_payloads, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.publish_failures, 1);
    Ok(())
}

#[tokio::test]
async fn full_queue_fails_dispatch() -> Result<()> {
    let (channel, _rx) = queue(1);
    let receiver = CommandReceiver::new(
        sample_registry(),
        Dispatcher::new(Arc::new(channel), "sqlbot-worker"),
    );

    receiver
        .handle(&InboundRequest::new(slash_body("users", "t-1")))
        .await?;
    let err = receiver
        .handle(&InboundRequest::new(slash_body("users", "t-2")))
        .await
        .expect_err("second request should not fit");
    assert!(err.to_string().contains("queue is full"));
    Ok(())
}
