//! Filter lines from standard input.

use std::io::IsTerminal;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};

/// Yields input lines; when the source is a terminal or empty, yields one blank line so
/// the command still runs once with the flags alone.
pub struct InputLines<R> {
    lines: Option<Lines<R>>,
    yielded: bool,
}

impl InputLines<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        if std::io::stdin().is_terminal() {
            Self {
                lines: None,
                yielded: false,
            }
        } else {
            Self::new(BufReader::new(tokio::io::stdin()))
        }
    }
}

impl<R: AsyncBufRead + Unpin> InputLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: Some(reader.lines()),
            yielded: false,
        }
    }

    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if let Some(lines) = &mut self.lines {
            match lines.next_line().await? {
                Some(line) => {
                    self.yielded = true;
                    return Ok(Some(line));
                }
                None => self.lines = None,
            }
        }
        if self.yielded {
            Ok(None)
        } else {
            self.yielded = true;
            Ok(Some(String::new()))
        }
    }
}
