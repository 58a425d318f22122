//! Typed gateway events and the hook registry.
//!
//! Instead of matching on raw `(op, t, serde_json::Value)` tuples everywhere,
//! the gateway deserialises frames into [`GatewayEvent`]. Dispatches that
//! the bot may care about become [`DispatchEvent`]s, which are routed to the
//! hook registered for their [`EventKind`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bitflags::bitflags;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::Result;
use crate::types::*;

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

bitflags! {
    /// Gateway intents bitmask sent with IDENTIFY.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        const GUILDS = 1 << 0;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const DIRECT_MESSAGES = 1 << 12;
        const MESSAGE_CONTENT = 1 << 15;
    }
}

// ---------------------------------------------------------------------------
// Event kinds + payloads
// ---------------------------------------------------------------------------

/// The dispatches a hook can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageCreate,
    DirectMessageCreate,
    ReactionAdd,
    MessageUpdate,
    MessageDelete,
    InteractionCreate,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::MessageCreate,
        EventKind::DirectMessageCreate,
        EventKind::ReactionAdd,
        EventKind::MessageUpdate,
        EventKind::MessageDelete,
        EventKind::InteractionCreate,
    ];

    /// Intents required to receive this kind of event.
    ///
    /// Interactions are delivered regardless of intents.
    pub fn intents(self) -> Intents {
        match self {
            EventKind::MessageCreate => Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT,
            EventKind::DirectMessageCreate => Intents::DIRECT_MESSAGES,
            EventKind::ReactionAdd => Intents::GUILD_MESSAGE_REACTIONS,
            EventKind::MessageUpdate | EventKind::MessageDelete => Intents::GUILD_MESSAGES,
            EventKind::InteractionCreate => Intents::empty(),
        }
    }
}

/// A dispatch routed to a hook.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    MessageCreate(Message),
    DirectMessageCreate(Message),
    ReactionAdd(ReactionAdd),
    MessageUpdate(MessageUpdate),
    MessageDelete(MessageDelete),
    InteractionCreate(Interaction),
}

impl DispatchEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DispatchEvent::MessageCreate(_) => EventKind::MessageCreate,
            DispatchEvent::DirectMessageCreate(_) => EventKind::DirectMessageCreate,
            DispatchEvent::ReactionAdd(_) => EventKind::ReactionAdd,
            DispatchEvent::MessageUpdate(_) => EventKind::MessageUpdate,
            DispatchEvent::MessageDelete(_) => EventKind::MessageDelete,
            DispatchEvent::InteractionCreate(_) => EventKind::InteractionCreate,
        }
    }
}

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

/// A fully-parsed frame coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// First frame after connecting (op 10).
    Hello(Hello),

    /// Session established after IDENTIFY.
    Ready(ReadyEvent),

    /// Session successfully resumed after RESUME.
    Resumed,

    /// A dispatch with a registered-hook kind.
    Dispatch(DispatchEvent),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). The inner bool indicates whether
    /// the session is resumable (`true`) or we must re-identify (`false`).
    InvalidSession(bool),

    /// A frame we received but don't have a typed variant for.
    Unknown { event_name: Option<String>, op: u8 },
}

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// This never fails: unrecognised or malformed frames become
    /// [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t, payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            10 => match payload.d.map(serde_json::from_value::<Hello>) {
                Some(Ok(hello)) => GatewayEvent::Hello(hello),
                _ => GatewayEvent::Unknown {
                    event_name: None,
                    op: 10,
                },
            },
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
            },
        }
    }

    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let unknown = |name: Option<String>| GatewayEvent::Unknown {
            event_name: name,
            op: 0,
        };

        let Some(name) = event_name else {
            return unknown(None);
        };
        let Some(d) = data else {
            return unknown(Some(name));
        };

        let parsed = match name.as_str() {
            "READY" => parse(&name, d).map(GatewayEvent::Ready),
            "RESUMED" => Some(GatewayEvent::Resumed),
            "MESSAGE_CREATE" => parse::<Message>(&name, d).map(|msg| {
                if msg.is_direct() {
                    GatewayEvent::Dispatch(DispatchEvent::DirectMessageCreate(msg))
                } else {
                    GatewayEvent::Dispatch(DispatchEvent::MessageCreate(msg))
                }
            }),
            "MESSAGE_UPDATE" => {
                parse(&name, d).map(|m| GatewayEvent::Dispatch(DispatchEvent::MessageUpdate(m)))
            }
            "MESSAGE_DELETE" => {
                parse(&name, d).map(|m| GatewayEvent::Dispatch(DispatchEvent::MessageDelete(m)))
            }
            "MESSAGE_REACTION_ADD" => {
                parse(&name, d).map(|r| GatewayEvent::Dispatch(DispatchEvent::ReactionAdd(r)))
            }
            "INTERACTION_CREATE" => parse(&name, d)
                .map(|i| GatewayEvent::Dispatch(DispatchEvent::InteractionCreate(i))),
            _ => None,
        };

        parsed.unwrap_or_else(|| unknown(Some(name)))
    }
}

fn parse<T: DeserializeOwned>(event: &str, d: serde_json::Value) -> Option<T> {
    match serde_json::from_value(d) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(event, error = %e, "failed to parse dispatch payload");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Hook registry
// ---------------------------------------------------------------------------

type Hook = Arc<dyn Fn(DispatchEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handlers keyed by [`EventKind`], registered before the gateway runs.
///
/// Which hooks are registered also decides which intents are requested, so
/// the bot never asks for events (or permissions) it has no use for.
#[derive(Clone, Default)]
pub struct Hooks {
    handlers: HashMap<EventKind, Hook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any earlier registration.
    pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: Fn(DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers.insert(kind, hook);
        self
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Intents derived strictly from the registered hooks.
    pub fn intents(&self) -> Intents {
        self.handlers
            .keys()
            .fold(Intents::empty(), |acc, kind| acc | kind.intents())
    }

    /// Run the matching hook on its own task.
    ///
    /// Returns `None` when nothing is registered for the event's kind. Hook
    /// errors (and panics) stay inside the spawned task.
    pub fn dispatch(&self, event: DispatchEvent) -> Option<JoinHandle<()>> {
        let kind = event.kind();
        let hook = Arc::clone(self.handlers.get(&kind)?);
        Some(tokio::spawn(async move {
            if let Err(e) = hook(event).await {
                error!(event = ?kind, error = %e, "event hook failed");
            }
        }))
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("registered", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
