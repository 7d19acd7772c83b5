//! Parsing of the list server's text requests.
//!
//! A request is everything up to the first blank line (`\r\n\r\n` or
//! `\n\n`). Arguments are separated by whitespace, and the last argument of
//! each command takes the remainder of the text so titles may contain
//! spaces.

use crate::error::RequestError;
use shared::gameinfo::TEAM_COUNT;
use std::fmt;

/// Input beyond this without a terminator gets the client dropped.
pub const MAX_REQUEST_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Remove,
    SetNum,
    List,
    Get,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Add => "ADD",
            Command::Remove => "REMOVE",
            Command::SetNum => "SETNUM",
            Command::List => "LIST",
            Command::Get => "GET",
        })
    }
}

/// `ADD <name> <version> <build> <gameinfo> <title>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub name: String,
    pub version: String,
    pub build: String,
    pub game_info: String,
    pub title: String,
}

impl AddRequest {
    /// Builds the request from the five ADD arguments. The title may be
    /// empty.
    pub fn from_args(text: &str) -> Option<Self> {
        let args = split_args(text, 5, true)?;
        Some(Self {
            name: args[0].to_string(),
            version: args[1].to_string(),
            build: args[2].to_string(),
            game_info: args[3].to_string(),
            title: args[4].trim_end().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Add(AddRequest),
    Remove { name: String },
    SetNum { name: String, counts: [u16; TEAM_COUNT] },
    List,
    Get { path: String },
}

impl Request {
    pub fn parse(text: &str) -> Result<Request, RequestError> {
        let args = split_args(text, 2, true).ok_or(RequestError::Empty)?;
        let rest = args[1];
        match args[0] {
            "ADD" => AddRequest::from_args(rest)
                .map(Request::Add)
                .ok_or(RequestError::Malformed(Command::Add)),
            "REMOVE" => Ok(Request::Remove {
                name: rest.trim().to_string(),
            }),
            "SETNUM" => parse_setnum(rest).ok_or(RequestError::Malformed(Command::SetNum)),
            "LIST" => Ok(Request::List),
            "GET" => {
                let args = split_args(rest, 2, false).ok_or(RequestError::Malformed(Command::Get))?;
                if !args[1].starts_with("HTTP/") {
                    return Err(RequestError::Malformed(Command::Get));
                }
                Ok(Request::Get {
                    path: args[0].to_string(),
                })
            }
            other => Err(RequestError::UnknownCommand(other.to_string())),
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Request::Add(_) => Command::Add,
            Request::Remove { .. } => Command::Remove,
            Request::SetNum { .. } => Command::SetNum,
            Request::List => Command::List,
            Request::Get { .. } => Command::Get,
        }
    }
}

fn parse_setnum(text: &str) -> Option<Request> {
    let args = split_args(text, TEAM_COUNT + 1, false)?;
    let mut counts = [0u16; TEAM_COUNT];
    for (count, arg) in counts.iter_mut().zip(&args[1..]) {
        *count = arg.trim().parse().ok()?;
    }
    Some(Request::SetNum {
        name: args[0].to_string(),
        counts,
    })
}

/// Returns the offset where the request terminator starts, if the buffer
/// holds a complete request.
pub fn find_message_end(buf: &[u8]) -> Option<usize> {
    find(buf, b"\r\n\r\n").or_else(|| find(buf, b"\n\n"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits off `count - 1` whitespace separated tokens and puts the rest of
/// the text in the last slot. The text may not be empty or start with
/// whitespace. When `last_may_be_empty` is set, running out of text right
/// before the last slot yields an empty final argument.
pub fn split_args(text: &str, count: usize, last_may_be_empty: bool) -> Option<Vec<&str>> {
    if count == 0 || text.is_empty() || text.starts_with(char::is_whitespace) {
        return None;
    }
    let mut args = Vec::with_capacity(count);
    let mut rest = text;
    while args.len() < count - 1 {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        args.push(&rest[..end]);
        rest = rest[end..].trim_start();
        if rest.is_empty() {
            if last_may_be_empty && args.len() == count - 1 {
                break;
            }
            return None;
        }
    }
    args.push(rest);
    Some(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_end() {
        assert_eq!(find_message_end(b"LIST\n\n"), Some(4));
        assert_eq!(find_message_end(b"LIST\r\n\r\n"), Some(4));
        assert_eq!(find_message_end(b"LIST\n"), None);
        assert_eq!(find_message_end(b""), None);
    }

    #[test]
    fn test_split_keeps_rest_in_last() {
        assert_eq!(
            split_args("a b  c d e", 3, false),
            Some(vec!["a", "b", "c d e"])
        );
        assert_eq!(split_args("LIST", 2, true), Some(vec!["LIST", ""]));
        assert_eq!(split_args("LIST", 2, false), None);
        assert_eq!(split_args(" LIST", 2, true), None);
        assert_eq!(split_args("", 1, true), None);
        assert_eq!(split_args("a b", 4, true), None);
    }

    #[test]
    fn test_parse_add() {
        let request = Request::parse("ADD host:1234 BZFS0221 build1 gameinfo my title").unwrap();
        assert_eq!(
            request,
            Request::Add(AddRequest {
                name: "host:1234".into(),
                version: "BZFS0221".into(),
                build: "build1".into(),
                game_info: "gameinfo".into(),
                title: "my title".into(),
            })
        );
        assert_eq!(request.command(), Command::Add);
    }

    #[test]
    fn test_parse_add_without_title() {
        match Request::parse("ADD host:1234 BZFS0221 build1 gameinfo ").unwrap() {
            Request::Add(add) => assert_eq!(add.title, ""),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            Request::parse("ADD host:1234 BZFS0221"),
            Err(RequestError::Malformed(Command::Add))
        );
    }

    #[test]
    fn test_parse_other_commands() {
        assert_eq!(Request::parse("LIST"), Ok(Request::List));
        assert_eq!(
            Request::parse("REMOVE host:1234"),
            Ok(Request::Remove {
                name: "host:1234".into()
            })
        );
        assert_eq!(
            Request::parse("SETNUM host:1234 1 0 2 0 3"),
            Ok(Request::SetNum {
                name: "host:1234".into(),
                counts: [1, 0, 2, 0, 3]
            })
        );
        assert_eq!(
            Request::parse("SETNUM host:1234 1 0 x 0 3"),
            Err(RequestError::Malformed(Command::SetNum))
        );
        assert_eq!(
            Request::parse("GET / HTTP/1.1\r\nHost: list.example.org"),
            Ok(Request::Get { path: "/".into() })
        );
        assert_eq!(
            Request::parse("GET /"),
            Err(RequestError::Malformed(Command::Get))
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            Request::parse("DELETE everything"),
            Err(RequestError::UnknownCommand("DELETE".into()))
        );
        assert_eq!(Request::parse(""), Err(RequestError::Empty));
    }
}
