//! Typed representations of the Discord API objects the bot touches.
//!
//! These mirror the Discord API docs closely enough to deserialize gateway
//! events and REST responses without passing `serde_json::Value` around the
//! rest of the codebase. Fields we never read are simply not declared.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Discord IDs are snowflakes transmitted as strings in JSON.
pub type Snowflake = String;

// ---------------------------------------------------------------------------
// Gateway payload (the envelope that wraps every WS message)
// ---------------------------------------------------------------------------

/// Inbound gateway frame: `{"op": .., "d": .., "s": .., "t": ..}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// Gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

/// Outbound gateway frame. Only the client → server opcodes are ever built.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayCommand {
    pub op: Opcode,
    pub d: serde_json::Value,
}

impl GatewayCommand {
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: Opcode::Heartbeat,
            d: serde_json::json!(sequence),
        }
    }

    pub fn identify(token: &str, intents: u64) -> Self {
        Self {
            op: Opcode::Identify,
            d: serde_json::json!({
                "token": token,
                "intents": intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "speedrun-bot",
                    "device": "speedrun-bot",
                },
            }),
        }
    }

    pub fn resume(token: &str, session_id: &str, sequence: Option<u64>) -> Self {
        Self {
            op: Opcode::Resume,
            d: serde_json::json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence,
            }),
        }
    }
}

/// Data of the op-10 HELLO frame.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Hello {
    /// Milliseconds.
    pub heartbeat_interval: u64,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    pub discriminator: Option<String>,
    #[serde(default)]
    pub bot: bool,
    pub global_name: Option<String>,
}

impl User {
    /// `Username#Discriminator` or just `Username` for the new username system.
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some("0") | None => self.username.clone(),
            Some(disc) => format!("{}#{}", self.username, disc),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuildMember {
    pub user: Option<User>,
    pub nick: Option<String>,
}

// ---------------------------------------------------------------------------
// Message events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    /// Absent for direct messages.
    pub guild_id: Option<Snowflake>,
    pub author: User,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn is_direct(&self) -> bool {
        self.guild_id.is_none()
    }
}

/// MESSAGE_UPDATE carries a partial message; only the ids are guaranteed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageUpdate {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub guild_id: Option<Snowflake>,
    pub author: Option<User>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageDelete {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReactionAdd {
    pub user_id: Snowflake,
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    pub guild_id: Option<Snowflake>,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Emoji {
    pub id: Option<Snowflake>,
    /// Unicode character for standard emoji.
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

/// INTERACTION_CREATE type for slash commands.
pub const INTERACTION_APPLICATION_COMMAND: u8 = 2;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Interaction {
    pub id: Snowflake,
    pub application_id: Snowflake,
    #[serde(rename = "type")]
    pub kind: u8,
    pub token: String,
    pub channel_id: Option<Snowflake>,
    pub guild_id: Option<Snowflake>,
    /// Present when invoked in a guild.
    pub member: Option<GuildMember>,
    /// Present when invoked in a DM.
    pub user: Option<User>,
    pub data: Option<CommandData>,
}

impl Interaction {
    /// The invoking user, whether the interaction came from a guild or a DM.
    pub fn author(&self) -> Option<&User> {
        self.member
            .as_ref()
            .and_then(|m| m.user.as_ref())
            .or(self.user.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandData {
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandDataOption>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandDataOption {
    pub name: String,
    pub value: Option<serde_json::Value>,
}

impl CommandDataOption {
    /// Option value rendered as plain text (strings unquoted).
    pub fn value_text(&self) -> Option<String> {
        match self.value.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractionResponse {
    /// 4 = CHANNEL_MESSAGE_WITH_SOURCE
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<InteractionCallbackData>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InteractionCallbackData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl InteractionResponse {
    /// Shorthand for a simple text reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: 4,
            data: Some(InteractionCallbackData {
                content: Some(text.into()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// READY event payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadyEvent {
    pub v: u8,
    pub user: User,
    pub session_id: String,
    pub resume_gateway_url: String,
}

// ---------------------------------------------------------------------------
// Embed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedMedia>,
}

impl Embed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn image(mut self, url: impl Into<String>) -> Self {
        self.image = Some(EmbedMedia { url: url.into() });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmbedMedia {
    pub url: String,
}

// ---------------------------------------------------------------------------
// Outbound message bodies
// ---------------------------------------------------------------------------

/// Body for `POST /channels/{id}/messages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeds: Option<Vec<Embed>>,
}

impl CreateMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.content = Some(text.into());
        self
    }

    pub fn embed(mut self, embed: Embed) -> Self {
        self.embeds.get_or_insert_with(Vec::new).push(embed);
        self
    }
}

/// Body for `PATCH /channels/{id}/messages/{id}`.
///
/// `None` leaves a field untouched; `Some(vec![])` removes every embed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EditMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeds: Option<Vec<Embed>>,
}

impl EditMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.content = Some(text.into());
        self
    }

    pub fn embed(mut self, embed: Embed) -> Self {
        self.embeds = Some(vec![embed]);
        self
    }

    pub fn clear_embeds(mut self) -> Self {
        self.embeds = Some(Vec::new());
        self
    }
}

/// Only the id of a created message matters to us.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedMessage {
    pub id: Snowflake,
}

// ---------------------------------------------------------------------------
// Rate-limit info parsed from response headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_after: Option<f64>,
    pub bucket: Option<String>,
    pub is_global: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
