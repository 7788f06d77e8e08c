use std::sync::Arc;

use anyhow::Result;
use sqlbot::dispatch::Dispatcher;
use sqlbot::inbound::InboundRequest;
use sqlbot::receiver::{CommandReceiver, Outcome};
use sqlbot::testing::{FailingChannel, RecordingChannel, sample_registry};
use sqlbot::{Error, registry::credential_keys};

fn receiver_with(channel: RecordingChannel) -> CommandReceiver {
    CommandReceiver::new(
        sample_registry(),
        Dispatcher::new(Arc::new(channel), "sqlbot-worker"),
    )
}

fn slash(text: &str) -> InboundRequest {
    let body = serde_urlencoded::to_string([
        ("trigger_id", "13345224609.738474920.8088930838d88f008e0"),
        ("command", "/sql"),
        ("text", text),
        ("user_name", "alice"),
        ("channel_id", "C2147483705"),
    ])
    .expect("encode form");
    InboundRequest::new(body)
}

#[tokio::test]
async fn unknown_alias_returns_catalog() -> Result<()> {
    let channel = RecordingChannel::new();
    let receiver = receiver_with(channel.clone());

    let response = receiver.handle(&slash("missingalias")).await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.outcome, Outcome::AliasNotFound);

    let body = response.body();
    assert_eq!(
        body["text"],
        "The alias `missingalias` doesn't exist. Here are the available aliases you may call:"
    );
    let attachments = body["attachments"].as_array().expect("attachments");
    assert_eq!(attachments.len(), receiver.registry().len());
    for attachment in attachments {
        assert_eq!(attachment["fields"][0]["title"], "Alias");
        assert_eq!(attachment["actions"][0]["type"], "button");
    }
    assert!(channel.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_body_is_service_unavailable() -> Result<()> {
    let channel = RecordingChannel::new();
    let receiver = receiver_with(channel.clone());

    for body in ["", "this is not a form", "payload=%7Bbroken"] {
        let response = receiver.handle(&InboundRequest::new(body)).await?;
        assert_eq!(response.status, 503, "body {body:?}");
        assert_eq!(response.outcome, Outcome::Rejected);
        assert!(response.correlation_id.is_none());
    }
    assert!(channel.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn valid_alias_is_acknowledged_and_dispatched() -> Result<()> {
    let channel = RecordingChannel::new();
    let receiver = receiver_with(channel.clone());

    let response = receiver.handle(&slash("users")).await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.outcome, Outcome::Dispatched);
    let body = response.body();
    assert_eq!(
        body["text"],
        "alice has requested execution of users, executing now..."
    );
    assert!(body.get("attachments").is_none());

    let sent = channel.requests();
    assert_eq!(sent.len(), 1);
    let request = &sent[0];
    assert_eq!(request.alias, "users");
    assert_eq!(request.sql, "select id, name from users");
    assert_eq!(request.host, "db1.internal");
    assert_eq!(request.location, "C2147483705");
    assert_eq!(request.requester, "alice");
    assert_eq!(
        request.correlation_id,
        "13345224609.738474920.8088930838d88f008e0"
    );
    assert_eq!(request.credential.username, "reader");
    assert_eq!(channel.targets(), vec!["sqlbot-worker".to_string()]);
    Ok(())
}

#[tokio::test]
async fn button_interaction_dispatches_selected_alias() -> Result<()> {
    let channel = RecordingChannel::new();
    let receiver = receiver_with(channel.clone());

    let payload = r#"{"trigger_id":"btn-1","actions":[{"name":"alias","type":"button","value":"users"}],"user":{"name":"bob"},"channel":{"id":"C9"}}"#;
    let body = serde_urlencoded::to_string([("payload", payload)])?;
    let response = receiver.handle(&InboundRequest::new(body)).await?;

    assert_eq!(response.outcome, Outcome::Dispatched);
    assert_eq!(
        response.message.text,
        "bob has requested execution of users, executing now..."
    );
    let sent = channel.requests();
    assert_eq!(sent[0].correlation_id, "btn-1");
    assert_eq!(sent[0].location, "C9");
    Ok(())
}

#[tokio::test]
async fn missing_alias_is_a_validation_failure() -> Result<()> {
    let channel = RecordingChannel::new();
    let receiver = receiver_with(channel.clone());

    let response = receiver.handle(&slash("   ")).await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.outcome, Outcome::Invalid);
    assert!(response.message.text.contains("no alias"));
    assert!(channel.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_credentials_name_the_alias() -> Result<()> {
    let channel = RecordingChannel::new();
    let receiver = receiver_with(channel.clone());

    let response = receiver.handle(&slash("orders")).await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.outcome, Outcome::CredentialMissing);
    let text = &response.message.text;
    assert!(text.contains("`orders`"));
    assert!(text.contains("credentials"));
    assert!(!text.contains("doesn't exist"));
    assert!(channel.requests().is_empty());

    let (user_key, _) = credential_keys("orders");
    assert_eq!(user_key, "SQL_ORDERS_USERNAME");
    Ok(())
}

#[tokio::test]
async fn correlation_falls_back_to_trace_header() -> Result<()> {
    let channel = RecordingChannel::new();
    let receiver = receiver_with(channel.clone());

    let body = "text=users&user_name=alice&channel_id=C1";
    let request = InboundRequest::new(body).with_header("X-Amzn-Trace-Id", "Root=1-5e1b-abc");
    let response = receiver.handle(&request).await?;
    assert_eq!(response.correlation_id.as_deref(), Some("Root=1-5e1b-abc"));
    assert_eq!(channel.requests()[0].correlation_id, "Root=1-5e1b-abc");

    let response = receiver.handle(&InboundRequest::new(body)).await?;
    let generated = response.correlation_id.expect("generated id");
    assert!(!generated.is_empty());
    assert_eq!(channel.requests()[1].correlation_id, generated);
    Ok(())
}

#[tokio::test]
async fn dispatch_failure_propagates() -> Result<()> {
    let receiver = CommandReceiver::new(
        sample_registry(),
        Dispatcher::new(Arc::new(FailingChannel), "sqlbot-worker"),
    );
    let err = receiver
        .handle(&slash("users"))
        .await
        .expect_err("dispatch should fail");
    match err {
        Error::Dispatch { alias, .. } => assert_eq!(alias, "users"),
        other => panic!("wrong error: {other:?}"),
    }
    Ok(())
}
