//! Control protocol commands
//!
//! One command line per TCP connection, answered by one or more response
//! lines terminated with `END`.

use anyhow::Result;
use std::fmt;
use tracing::trace;

use crate::error::{RemoteErrorCode, StreamError};

/// Terminator line closing every response
pub const END_LINE: &str = "END";

/// Commands accepted by the control server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List every shareable item
    Catalog,
    /// Ask whether a content id is held
    Has { id: String },
    /// Ask for size and chunk count
    Meta { id: String },
    /// Fetch one chunk
    GetChunk { id: String, index: u32 },
}

impl Command {
    /// Parse a command line.
    ///
    /// Arguments may be pipe-separated (`GETCHUNK|id|3`) or
    /// whitespace-separated (`GETCHUNK id 3`). In the whitespace form the id
    /// may itself contain spaces.
    pub fn parse(line: &str) -> std::result::Result<Self, RemoteErrorCode> {
        let line = line.trim();
        let (word, rest) = split_word(line);
        let word = word.to_ascii_uppercase();
        trace!("Parsing control command '{}'", word);

        match word.as_str() {
            "CATALOG" => Ok(Command::Catalog),
            "HAS" => Ok(Command::Has { id: single_arg(rest)? }),
            "META" => Ok(Command::Meta { id: single_arg(rest)? }),
            "GETCHUNK" => {
                let (id, index) = id_and_index(rest)?;
                Ok(Command::GetChunk { id, index })
            }
            _ => Err(RemoteErrorCode::Unknown),
        }
    }

    /// Render the pipe-separated wire form (without newline)
    pub fn to_line(&self) -> String {
        match self {
            Command::Catalog => "CATALOG".to_string(),
            Command::Has { id } => format!("HAS|{}", id),
            Command::Meta { id } => format!("META|{}", id),
            Command::GetChunk { id, index } => format!("GETCHUNK|{}|{}", id, index),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Split off the command word and the raw argument remainder
fn split_word(line: &str) -> (&str, Args<'_>) {
    if let Some((word, rest)) = line.split_once('|') {
        return (word.trim(), Args::Piped(rest));
    }
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, Args::Spaced(rest.trim())),
        None => (line, Args::Spaced("")),
    }
}

#[derive(Debug, Clone, Copy)]
enum Args<'a> {
    Piped(&'a str),
    Spaced(&'a str),
}

fn single_arg(args: Args<'_>) -> std::result::Result<String, RemoteErrorCode> {
    let id = match args {
        Args::Piped(rest) => rest.split('|').next().unwrap_or("").trim(),
        Args::Spaced(rest) => rest,
    };
    if id.is_empty() {
        return Err(RemoteErrorCode::Args);
    }
    Ok(id.to_string())
}

fn id_and_index(args: Args<'_>) -> std::result::Result<(String, u32), RemoteErrorCode> {
    let (id, index) = match args {
        Args::Piped(rest) => {
            let mut parts = rest.split('|');
            let id = parts.next().unwrap_or("");
            let index = parts.next().ok_or(RemoteErrorCode::Args)?;
            (id, index)
        }
        Args::Spaced(rest) => rest.rsplit_once(char::is_whitespace).ok_or(RemoteErrorCode::Args)?,
    };
    let id = id.trim();
    if id.is_empty() {
        return Err(RemoteErrorCode::Args);
    }
    let index = index.trim().parse::<u32>().map_err(|_| RemoteErrorCode::Args)?;
    Ok((id.to_string(), index))
}

/// Non-catalog response lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Yes,
    No,
    End,
    /// `SIZE|<n>|CHUNKS|<n>`
    Size { size: u64, chunks: u32 },
    /// `DATA|<index>|<len>`, followed by exactly `len` raw bytes
    Data { index: u32, len: u64 },
    /// `ERR|<code>`
    Err(RemoteErrorCode),
}

impl ControlLine {
    /// Render the line (without newline)
    pub fn to_line(&self) -> String {
        match self {
            ControlLine::Yes => "YES".to_string(),
            ControlLine::No => "NO".to_string(),
            ControlLine::End => END_LINE.to_string(),
            ControlLine::Size { size, chunks } => format!("SIZE|{}|CHUNKS|{}", size, chunks),
            ControlLine::Data { index, len } => format!("DATA|{}|{}", index, len),
            ControlLine::Err(code) => format!("ERR|{}", code),
        }
    }

    /// Parse a response line
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        match parts[0] {
            "YES" => Ok(ControlLine::Yes),
            "NO" => Ok(ControlLine::No),
            END_LINE => Ok(ControlLine::End),
            "SIZE" if parts.len() >= 4 && parts[2] == "CHUNKS" => Ok(ControlLine::Size {
                size: parse_number(parts[1], "size")?,
                chunks: parse_number(parts[3], "chunks")?,
            }),
            "DATA" if parts.len() >= 3 => Ok(ControlLine::Data {
                index: parse_number(parts[1], "index")?,
                len: parse_number(parts[2], "length")?,
            }),
            "ERR" if parts.len() >= 2 => RemoteErrorCode::from_token(parts[1])
                .map(ControlLine::Err)
                .ok_or_else(|| {
                    StreamError::protocol_error_with_source("Unknown error code", line.to_string()).into()
                }),
            _ => Err(StreamError::protocol_error_with_source("Unexpected response line", line.to_string()).into()),
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| StreamError::protocol_error_with_source(format!("Invalid {} in response", field), value.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_piped_commands() {
        assert_eq!(Command::parse("CATALOG"), Ok(Command::Catalog));
        assert_eq!(Command::parse("HAS|abc\r\n"), Ok(Command::Has { id: "abc".to_string() }));
        assert_eq!(Command::parse("META|movie.mp4"), Ok(Command::Meta { id: "movie.mp4".to_string() }));
        assert_eq!(
            Command::parse("GETCHUNK|movie.mp4|7"),
            Ok(Command::GetChunk { id: "movie.mp4".to_string(), index: 7 })
        );
    }

    #[test]
    fn test_parse_spaced_commands() {
        assert_eq!(
            Command::parse("HAS my holiday.mp4"),
            Ok(Command::Has { id: "my holiday.mp4".to_string() })
        );
        assert_eq!(
            Command::parse("getchunk my holiday.mp4 12"),
            Ok(Command::GetChunk { id: "my holiday.mp4".to_string(), index: 12 })
        );
    }

    #[test]
    fn test_parse_argument_errors() {
        assert_eq!(Command::parse("HAS"), Err(RemoteErrorCode::Args));
        assert_eq!(Command::parse("META|"), Err(RemoteErrorCode::Args));
        assert_eq!(Command::parse("GETCHUNK|movie.mp4"), Err(RemoteErrorCode::Args));
        assert_eq!(Command::parse("GETCHUNK movie.mp4 x"), Err(RemoteErrorCode::Args));
        assert_eq!(Command::parse("GETCHUNK|movie.mp4|-1"), Err(RemoteErrorCode::Args));
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(Command::parse("DELETE|x"), Err(RemoteErrorCode::Unknown));
        assert_eq!(Command::parse(""), Err(RemoteErrorCode::Unknown));
    }

    #[test]
    fn test_command_line_form_parses_back() {
        let cmd = Command::GetChunk { id: "f".repeat(64), index: 40 };
        assert_eq!(Command::parse(&cmd.to_line()), Ok(cmd));
    }

    #[test]
    fn test_parse_response_lines() {
        assert_eq!(ControlLine::parse("YES").unwrap(), ControlLine::Yes);
        assert_eq!(ControlLine::parse("END\r").unwrap(), ControlLine::End);
        assert_eq!(
            ControlLine::parse("SIZE|10300000|CHUNKS|40").unwrap(),
            ControlLine::Size { size: 10_300_000, chunks: 40 }
        );
        assert_eq!(
            ControlLine::parse("DATA|3|262144").unwrap(),
            ControlLine::Data { index: 3, len: 262_144 }
        );
        assert_eq!(
            ControlLine::parse("ERR|RANGE").unwrap(),
            ControlLine::Err(RemoteErrorCode::Range)
        );
    }

    #[test]
    fn test_parse_bad_response_lines() {
        assert!(ControlLine::parse("SIZE|abc|CHUNKS|1").is_err());
        assert!(ControlLine::parse("ERR|WHATEVER").is_err());
        assert!(ControlLine::parse("HELLO").is_err());
        assert!(ControlLine::parse("DATA|1").is_err());
    }
}
