//! Chat command routing.
//!
//! `!ping` answers in the channel. `!whisper <text>` sends `<text>` back to
//! the caller privately, and a whispered `!ping` gets a whispered `pong`.

use chatline_sdk::event::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Say(String),
    Whisper {
        to: String,
        user_id: Option<String>,
        body: String,
    },
}

pub fn route(event: &Event, prefix: &str) -> Option<Action> {
    match event {
        Event::ChannelMessage {
            from, user_id, text, ..
        } => {
            let (cmd, rest) = command(text, prefix)?;
            match cmd {
                "ping" => Some(Action::Say("pong".to_string())),
                "whisper" if !rest.is_empty() => Some(Action::Whisper {
                    to: from.clone(),
                    user_id: user_id.clone(),
                    body: rest.to_string(),
                }),
                _ => None,
            }
        }
        Event::Whisper {
            from, user_id, text, ..
        } => match command(text, prefix)? {
            ("ping", _) => Some(Action::Whisper {
                to: from.clone(),
                user_id: user_id.clone(),
                body: "pong".to_string(),
            }),
            _ => None,
        },
        _ => None,
    }
}

fn command<'a>(text: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let body = text.trim().strip_prefix(prefix)?;
    let (cmd, rest) = body.split_once(' ').unwrap_or((body, ""));
    Some((cmd, rest.trim()))
}
