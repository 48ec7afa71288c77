//! Parsing of the commands a user types into the client.

use anyhow::{Result, anyhow};

pub const USAGE: &str =
    "commands: create [nickname], subscribe <nickname>, message <nickname> <text>, list, help, quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// An empty nickname lets the server pick one.
    Create { nickname: String },
    Subscribe { nickname: String },
    Message { nickname: String, text: String },
    List,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one line of input. The command word is case-insensitive; the
    /// message text is everything after the nickname, kept as typed.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim_start()),
            None => (trimmed, ""),
        };
        if word.is_empty() {
            return Err(anyhow!("empty command"));
        }

        let mut args = rest.split_whitespace();
        match word.to_lowercase().as_str() {
            "create" => match (args.next(), args.next()) {
                (nickname, None) => Ok(ConsoleCommand::Create {
                    nickname: nickname.unwrap_or_default().to_string(),
                }),
                _ => Err(anyhow!("create takes at most one argument: create [nickname]")),
            },
            "subscribe" => match (args.next(), args.next()) {
                (Some(nickname), None) => Ok(ConsoleCommand::Subscribe {
                    nickname: nickname.to_string(),
                }),
                _ => Err(anyhow!("subscribe takes exactly one argument: subscribe <nickname>")),
            },
            "message" => {
                let (nickname, text) = match rest.split_once(char::is_whitespace) {
                    Some((nickname, text)) => (nickname, text.trim()),
                    None => (rest, ""),
                };
                if nickname.is_empty() || text.is_empty() {
                    return Err(anyhow!("usage: message <nickname> <text>"));
                }
                Ok(ConsoleCommand::Message {
                    nickname: nickname.to_string(),
                    text: text.to_string(),
                })
            }
            "list" => Ok(ConsoleCommand::List),
            "help" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => Err(anyhow!("unknown command '{other}'. {USAGE}")),
        }
    }
}
