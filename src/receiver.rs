use serde_json::Value;
use tracing::Instrument;

use crate::{
    Error, Result,
    context::RequestContext,
    dispatch::{Dispatcher, ExecutionRequest},
    inbound::{InboundRequest, correlation_id, parse_body},
    message::{FormattedMessage, build_catalog, credential_missing_text, missing_alias_text},
    metrics,
    registry::AliasRegistry,
};

pub const STATUS_OK: u16 = 200;
pub const STATUS_UNAVAILABLE: u16 = 503;

const UNKNOWN_REQUESTER: &str = "someone";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Body could not be parsed, so no correlation id exists.
    Rejected,
    /// No alias (or no channel to answer in) was supplied.
    Invalid,
    AliasNotFound,
    CredentialMissing,
    Dispatched,
}

/// Immediate answer to the chat platform. Every application-level outcome
/// is a 200; 503 is reserved for bodies that cannot be parsed at all.
#[derive(Clone, Debug)]
pub struct ReceiverResponse {
    pub status: u16,
    pub outcome: Outcome,
    pub correlation_id: Option<String>,
    pub message: FormattedMessage,
}

impl ReceiverResponse {
    fn ok(outcome: Outcome, ctx: &RequestContext, message: FormattedMessage) -> Self {
        Self {
            status: STATUS_OK,
            outcome,
            correlation_id: Some(ctx.correlation_id.clone()),
            message,
        }
    }

    pub fn body(&self) -> Value {
        self.message.to_json()
    }
}

pub struct CommandReceiver {
    registry: AliasRegistry,
    dispatcher: Dispatcher,
}

impl CommandReceiver {
    pub fn new(registry: AliasRegistry, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &AliasRegistry {
        &self.registry
    }

    /// Validate the request and hand execution off. Only a failure to enqueue
    /// the execution is returned as an error.
    pub async fn handle(&self, request: &InboundRequest) -> Result<ReceiverResponse> {
        metrics::record_request();

        let command = match parse_body(&request.body) {
            Ok(command) => command,
            Err(err) => {
                tracing::error!(target: "sqlbot::receiver", error = %err, "unable to parse request body");
                return Ok(ReceiverResponse {
                    status: STATUS_UNAVAILABLE,
                    outcome: Outcome::Rejected,
                    correlation_id: None,
                    message: FormattedMessage::in_channel(
                        "Sorry, the request could not be processed.",
                    ),
                });
            }
        };

        let mut builder = RequestContext::builder(correlation_id(&command, request));
        if let Some(requester) = &command.requester {
            builder = builder.requester(requester.clone());
        }
        if let Some(channel) = &command.channel {
            builder = builder.location(channel.clone());
        }
        let ctx = builder.build();
        let span = ctx.span().clone();

        async move {
            tracing::debug!(target: "sqlbot::receiver", source = ?command.source, "request parsed");

            let Some(alias) = command.alias.as_deref() else {
                tracing::info!(target: "sqlbot::receiver", "no alias supplied");
                return Ok(ReceiverResponse::ok(
                    Outcome::Invalid,
                    &ctx,
                    FormattedMessage::in_channel(missing_alias_text()),
                ));
            };

            let Some(definition) = self.registry.lookup(alias) else {
                metrics::record_alias_not_found();
                tracing::info!(target: "sqlbot::receiver", alias, "alias not found, returning catalog");
                return Ok(ReceiverResponse::ok(
                    Outcome::AliasNotFound,
                    &ctx,
                    build_catalog(self.registry.entries(), Some(alias)),
                ));
            };

            let Some(credential) = self.registry.resolve_credential(alias) else {
                metrics::record_credential_missing();
                tracing::warn!(target: "sqlbot::receiver", alias, "credentials not configured");
                return Ok(ReceiverResponse::ok(
                    Outcome::CredentialMissing,
                    &ctx,
                    FormattedMessage::in_channel(credential_missing_text(alias)),
                ));
            };

            let Some(location) = ctx.location.clone() else {
                tracing::info!(target: "sqlbot::receiver", alias, "no channel to deliver to");
                return Ok(ReceiverResponse::ok(
                    Outcome::Invalid,
                    &ctx,
                    FormattedMessage::in_channel(
                        "Sorry, I couldn't tell which channel to answer in.",
                    ),
                ));
            };

            let requester = ctx
                .requester
                .clone()
                .unwrap_or_else(|| UNKNOWN_REQUESTER.to_string());
            let execution = ExecutionRequest::new(
                definition,
                credential,
                location,
                ctx.correlation_id.clone(),
                requester,
            );

            let ack = self
                .dispatcher
                .dispatch(&ctx, &execution)
                .await
                .inspect_err(|err: &Error| {
                    tracing::error!(
                        target: "sqlbot::receiver",
                        alias,
                        dispatch_target = %self.dispatcher.target(),
                        error = %err,
                        "dispatch failed"
                    );
                })?;
            Ok(ReceiverResponse::ok(Outcome::Dispatched, &ctx, ack))
        }
        .instrument(span)
        .await
    }
}
