//! Line-oriented JSON output on stdout.

use nostr::Event;
use nostr_client::{ClientMessage, Filter};
use std::io::Write;

pub struct Output<W: Write> {
    writer: W,
}

impl<W: Write> Output<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn event(&mut self, event: &Event) -> anyhow::Result<()> {
        let json = serde_json::to_string(event)?;
        self.line(&json)
    }

    /// Print `filter` alone (`bare`) or as `["REQ", subscription_id, filter]`.
    pub fn filter(&mut self, filter: &Filter, bare: bool, subscription_id: &str) -> anyhow::Result<()> {
        let json = if bare {
            filter.to_string()
        } else {
            ClientMessage::req(subscription_id, filter.clone()).to_json()?
        };
        self.line(&json)
    }

    fn line(&mut self, text: &str) -> anyhow::Result<()> {
        writeln!(self.writer, "{}", text)?;
        self.writer.flush()?;
        Ok(())
    }
}
