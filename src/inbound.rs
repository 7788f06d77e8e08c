use serde::Deserialize;
use uuid::Uuid;

use crate::{Error, Result};

/// Transport headers checked, in order, for an upstream trace identifier.
pub const CORRELATION_HEADERS: [&str; 3] = ["correlation-id", "x-correlation-id", "x-amzn-trace-id"];

/// Raw inbound webhook: the URL-encoded body plus the envelope's headers.
#[derive(Clone, Debug, Default)]
pub struct InboundRequest {
    pub body: String,
    headers: Vec<(String, String)>,
}

impl InboundRequest {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup; blank values are ignored.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(name) && !v.trim().is_empty())
            .map(|(_, v)| v.trim())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FormBody {
    trigger_id: Option<String>,
    text: Option<String>,
    user_name: Option<String>,
    channel_id: Option<String>,
    command: Option<String>,
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InteractionPayload {
    trigger_id: Option<String>,
    #[serde(default)]
    actions: Vec<ActionValue>,
    user: Option<PayloadUser>,
    channel: Option<PayloadChannel>,
}

#[derive(Debug, Deserialize)]
struct ActionValue {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayloadUser {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayloadChannel {
    id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandSource {
    SlashCommand { command: Option<String> },
    Button,
}

/// The fields the receiver needs, normalized across slash commands and
/// button interactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundCommand {
    pub source: CommandSource,
    pub trigger_id: Option<String>,
    pub alias: Option<String>,
    pub requester: Option<String>,
    pub channel: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a URL-encoded body. A body that is empty, contains a segment that
/// is not `key=value`, or carries a `payload` that is not valid interaction
/// JSON is rejected.
pub fn parse_body(body: &str) -> Result<InboundCommand> {
    let body = body.trim();
    if body.is_empty() {
        return Err(Error::BodyParse("empty body".into()));
    }
    if let Some(segment) = body
        .split('&')
        .find(|segment| !segment.is_empty() && !segment.contains('='))
    {
        let preview: String = segment.chars().take(32).collect();
        return Err(Error::BodyParse(format!(
            "`{preview}` is not a key=value pair"
        )));
    }

    let form: FormBody =
        serde_urlencoded::from_str(body).map_err(|e| Error::BodyParse(e.to_string()))?;

    if let Some(raw) = form.payload {
        let payload: InteractionPayload = serde_json::from_str(&raw)
            .map_err(|e| Error::BodyParse(format!("interaction payload: {e}")))?;
        let alias = payload.actions.into_iter().next().and_then(|a| a.value);
        return Ok(InboundCommand {
            source: CommandSource::Button,
            trigger_id: non_blank(form.trigger_id).or_else(|| non_blank(payload.trigger_id)),
            alias: non_blank(alias),
            requester: non_blank(payload.user.and_then(|u| u.name)),
            channel: non_blank(payload.channel.and_then(|c| c.id)),
        });
    }

    let alias = non_blank(form.text)
        .and_then(|text| text.split_whitespace().next().map(str::to_string));
    Ok(InboundCommand {
        source: CommandSource::SlashCommand {
            command: non_blank(form.command),
        },
        trigger_id: non_blank(form.trigger_id),
        alias,
        requester: non_blank(form.user_name),
        channel: non_blank(form.channel_id),
    })
}

/// Trigger id from the body, then a correlation header, then a fresh UUID.
pub fn correlation_id(command: &InboundCommand, request: &InboundRequest) -> String {
    if let Some(id) = &command.trigger_id {
        return id.clone();
    }
    CORRELATION_HEADERS
        .iter()
        .find_map(|name| request.header(name))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
