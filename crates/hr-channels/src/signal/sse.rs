//! Incremental server-sent-events parser.
//!
//! Bytes are appended to an internal buffer; complete events (delimited by a
//! blank line) are extracted, the trailing partial block stays buffered for
//! the next read. Within an event, `data:` lines are coalesced with `\n`,
//! `:`-prefixed comment lines are ignored, and the event type defaults to
//! `message` when absent.

/// One parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental parser. Never drops bytes across reads.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        // Normalize CRLF so blank-line detection is uniform.
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(block.trim_end_matches('\n')) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes currently held back as an incomplete block.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_type: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = field_value(line, "event") {
            event_type = Some(rest.to_string());
        } else if let Some(rest) = field_value(line, "data") {
            data_lines.push(rest);
        }
        // Other fields (id, retry) are irrelevant to the relay.
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event_type.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

/// `field: value` with a single optional space after the colon.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
