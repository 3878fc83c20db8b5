//! Inbound line classification.
//!
//! Protocol housekeeping (PING/PONG, RECONNECT, auth notices, welcome
//! numerics) is consumed by the client; everything else becomes an
//! [`Event`] for the caller.

use std::collections::HashMap;

use crate::irc::Message;

/// Server notices that mean the access token is no longer accepted.
const AUTH_FAILURE_NOTICES: &[&str] = &[
    "Login authentication failed",
    "Improperly formatted auth",
    "Login unsuccessful",
];

/// Events the client hands to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Handshake sent on a fresh connection.
    Connected { secure: bool },

    /// Our own JOIN was echoed back.
    Joined { channel: String },

    /// Public chat in the joined channel.
    ChannelMessage {
        from: String,
        user_id: Option<String>,
        channel: String,
        text: String,
        tags: HashMap<String, String>,
    },

    /// A private message addressed to us.
    Whisper {
        from: String,
        user_id: Option<String>,
        text: String,
        tags: HashMap<String, String>,
    },

    /// Server or channel NOTICE that is not an auth failure.
    Notice { msg_id: Option<String>, text: String },

    /// Subscriptions, raids and similar system messages.
    UserNotice {
        channel: String,
        msg_id: Option<String>,
        text: String,
        tags: HashMap<String, String>,
    },

    /// The server rejected our credential; a refresh is under way.
    AuthFailed { reason: String },

    /// The connection was torn down and will be rebuilt.
    Reconnecting { reason: String },

    /// A reconnect attempt failed; the next one waits for the backoff.
    Disconnected { reason: String },
}

/// What an inbound line means to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Event(Event),
    /// Server keepalive; answer with `PONG :<token>`.
    ServerPing(Option<String>),
    /// Answer to a keepalive probe.
    Pong(Option<String>),
    /// Server asks us to reconnect.
    Reconnect,
    /// Credential rejected by the server.
    AuthRejected(String),
    /// Registration completed (`001`).
    Registered,
    Ignored,
}

pub fn classify(msg: &Message, own_nick: &str) -> Inbound {
    match msg.command.as_str() {
        "PING" => Inbound::ServerPing(msg.trailing().map(str::to_string)),
        "PONG" => Inbound::Pong(msg.trailing().map(str::to_string)),
        "RECONNECT" => Inbound::Reconnect,
        "001" => Inbound::Registered,
        "NOTICE" => {
            let text = msg.trailing().unwrap_or_default().to_string();
            if AUTH_FAILURE_NOTICES.iter().any(|n| text.contains(n)) {
                return Inbound::AuthRejected(text);
            }
            Inbound::Event(Event::Notice {
                msg_id: msg.tag("msg-id").map(str::to_string),
                text,
            })
        }
        "JOIN" => match (msg.nick(), msg.params.first()) {
            (Some(nick), Some(channel)) if nick.eq_ignore_ascii_case(own_nick) => {
                Inbound::Event(Event::Joined {
                    channel: channel.clone(),
                })
            }
            _ => Inbound::Ignored,
        },
        "PRIVMSG" if msg.params.len() >= 2 => Inbound::Event(Event::ChannelMessage {
            from: msg.nick().unwrap_or_default().to_string(),
            user_id: msg.tag("user-id").map(str::to_string),
            channel: msg.params[0].clone(),
            text: msg.params[1].clone(),
            tags: msg.tags.clone(),
        }),
        "WHISPER" if msg.params.len() >= 2 => Inbound::Event(Event::Whisper {
            from: msg.nick().unwrap_or_default().to_string(),
            user_id: msg.tag("user-id").map(str::to_string),
            text: msg.params[1].clone(),
            tags: msg.tags.clone(),
        }),
        "USERNOTICE" if !msg.params.is_empty() => Inbound::Event(Event::UserNotice {
            channel: msg.params[0].clone(),
            msg_id: msg.tag("msg-id").map(str::to_string),
            text: msg
                .tag("system-msg")
                .or_else(|| msg.params.get(1).map(|s| s.as_str()))
                .unwrap_or_default()
                .to_string(),
            tags: msg.tags.clone(),
        }),
        _ => Inbound::Ignored,
    }
}
