use serde::Serialize;
use serde_json::{Value, json};

use crate::registry::QueryDefinition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    InChannel,
}

/// Structured block of a chat message describing one alias.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub alias: String,
    pub sql: String,
    pub host: String,
    pub database: String,
    pub table_text: Option<String>,
    /// Render a button whose value re-invokes the alias.
    pub actionable: bool,
}

impl Attachment {
    pub fn describe(def: &QueryDefinition) -> Self {
        Self {
            alias: def.alias.clone(),
            sql: def.sql.clone(),
            host: def.host.clone(),
            database: def.database.clone(),
            table_text: None,
            actionable: false,
        }
    }

    pub fn with_table(mut self, table_text: impl Into<String>) -> Self {
        self.table_text = Some(table_text.into());
        self
    }

    pub fn actionable(mut self) -> Self {
        self.actionable = true;
        self
    }

    fn to_json(&self) -> Value {
        let mut fields = vec![
            field("Alias", &self.alias, true),
            field("SQL statement", &self.sql, false),
            field("MySQL Server", &self.host, true),
            field("Database", &self.database, true),
        ];
        if let Some(table) = &self.table_text {
            fields.push(field("Result", &format!("```\n{table}\n```"), false));
        }

        let mut attachment = json!({
            "fallback": format!("Alias {}", self.alias),
            "fields": fields,
        });
        if self.actionable {
            attachment["callback_id"] = json!("sqlbot_alias");
            attachment["actions"] = json!([{
                "name": "alias",
                "text": self.alias,
                "type": "button",
                "value": self.alias,
            }]);
        }
        attachment
    }
}

fn field(title: &str, value: &str, short: bool) -> Value {
    json!({ "title": title, "value": value, "short": short })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormattedMessage {
    pub response_type: ResponseType,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl FormattedMessage {
    pub fn in_channel(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::InChannel,
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Chat platform response body.
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "response_type": self.response_type,
            "text": self.text,
        });
        if !self.attachments.is_empty() {
            body["attachments"] =
                Value::Array(self.attachments.iter().map(Attachment::to_json).collect());
        }
        body
    }

    /// Text handed to the upload call: the first result table, or the message text.
    pub fn upload_content(&self) -> &str {
        self.attachments
            .iter()
            .find_map(|a| a.table_text.as_deref())
            .unwrap_or(&self.text)
    }
}

pub fn not_found_text(alias: &str) -> String {
    format!("The alias `{alias}` doesn't exist. Here are the available aliases you may call:")
}

pub fn missing_alias_text() -> String {
    "Sorry, no alias was given. Please call me with the alias of the query to run, e.g. `/sql <alias>`."
        .to_string()
}

pub fn credential_missing_text(alias: &str) -> String {
    format!(
        "Sorry, credentials for the alias `{alias}` are not configured. Please ask an administrator to set them up."
    )
}

pub fn credential_rejected_text(alias: &str) -> String {
    format!(
        "Credentials for the alias `{alias}` appear to be unconfigured: the database server rejected the login."
    )
}

pub fn ack_text(requester: &str, alias: &str) -> String {
    format!("{requester} has requested execution of {alias}, executing now...")
}

pub fn connection_failed_text(host: &str, attempts: u32) -> String {
    format!("Failed to connect to MySQL server `{host}` after {attempts} attempt(s), giving up.")
}

pub fn query_failed_text(alias: &str) -> String {
    format!("Execution of the alias `{alias}` failed, please check the logs for details.")
}

pub fn formatting_failed_text(alias: &str) -> String {
    format!("Formatting the result of `{alias}` failed, please check the logs for details.")
}

pub fn result_text(alias: &str) -> String {
    format!("Result of `{alias}`:")
}

/// One actionable attachment per configured alias. With `attempted_alias`
/// the text explains that the alias is unknown.
pub fn build_catalog<'a>(
    entries: impl IntoIterator<Item = &'a QueryDefinition>,
    attempted_alias: Option<&str>,
) -> FormattedMessage {
    let text = match attempted_alias {
        Some(alias) => not_found_text(alias),
        None => "Here are the available aliases you may call:".to_string(),
    };
    entries
        .into_iter()
        .fold(FormattedMessage::in_channel(text), |msg, def| {
            msg.with_attachment(Attachment::describe(def).actionable())
        })
}
