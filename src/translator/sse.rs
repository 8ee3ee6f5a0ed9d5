use serde::{Deserialize, Serialize};

use super::TranslateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

/// Push-based SSE decoder. Bytes go in as they arrive from the backend;
/// complete events come out. Only the unterminated tail is buffered.
#[derive(Debug, Default)]
pub struct SseDecoder {
    limits: SseLimits,
    line: Vec<u8>,
    event: Option<String>,
    data: String,
    has_data: bool,
}

impl SseDecoder {
    pub fn new(limits: SseLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, TranslateError> {
        let mut frames = Vec::new();
        let mut rest = chunk;
        while !rest.is_empty() {
            let newline = rest.iter().position(|b| *b == b'\n');
            let take = newline.map(|pos| pos + 1).unwrap_or(rest.len());
            if self.line.len().saturating_add(take) > self.limits.max_line_bytes.saturating_add(1)
            {
                return Err(TranslateError::Malformed(format!(
                    "SSE line exceeds max_line_bytes={}",
                    self.limits.max_line_bytes
                )));
            }
            self.line.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if newline.is_some() {
                let line = std::mem::take(&mut self.line);
                if let Some(frame) = self.process_line(&line)? {
                    frames.push(frame);
                }
            }
        }
        Ok(frames)
    }

    /// Flushes whatever is buffered once the backend closes the stream.
    pub fn finish(&mut self) -> Result<Option<SseFrame>, TranslateError> {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            if let Some(frame) = self.process_line(&line)? {
                return Ok(Some(frame));
            }
        }
        Ok(self.dispatch())
    }

    fn process_line(&mut self, raw: &[u8]) -> Result<Option<SseFrame>, TranslateError> {
        let line = std::str::from_utf8(raw)
            .map_err(|err| TranslateError::Malformed(format!("invalid SSE UTF-8: {err}")))?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                let separator = usize::from(self.has_data);
                if self
                    .data
                    .len()
                    .saturating_add(separator)
                    .saturating_add(value.len())
                    > self.limits.max_event_bytes
                {
                    return Err(TranslateError::Malformed(format!(
                        "SSE event exceeds max_event_bytes={}",
                        self.limits.max_event_bytes
                    )));
                }
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseFrame {
            event,
            data: std::mem::take(&mut self.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new(SseLimits::default());
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.push(chunk).expect("push"));
        }
        out.extend(decoder.finish().expect("finish"));
        out
    }

    #[test]
    fn parses_events_and_multiline_data() {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"hello\":1}\n\n",
            ": keep-alive\n",
            "data: line1\n",
            "data: line2\n\n",
            "data: [DONE]\n\n",
        );
        let frames = decode_all(&[sse.as_bytes()]);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"hello\":1}");
        assert_eq!(frames[1].event, None);
        assert_eq!(frames[1].data, "line1\nline2");
        assert!(frames[2].is_done());
    }

    #[test]
    fn frames_split_across_chunks_decode_identically() {
        let sse = "data: {\"a\":\"xyz\"}\r\n\r\ndata: {\"b\":2}\n\n";
        let whole = decode_all(&[sse.as_bytes()]);
        let bytes = sse.as_bytes();
        let pieces: Vec<&[u8]> = bytes.chunks(3).collect();
        let split = decode_all(&pieces);
        assert_eq!(whole, split);
        assert_eq!(whole.len(), 2);
    }

    #[test]
    fn flushes_unterminated_tail() {
        let frames = decode_all(&[b"data: {\"tail\":true}"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"tail\":true}");
    }

    #[test]
    fn enforces_line_limit() {
        let mut decoder = SseDecoder::new(SseLimits {
            max_line_bytes: 8,
            max_event_bytes: 1024,
        });
        let err = decoder
            .push(b"data: 0123456789\n")
            .expect_err("line too long");
        assert!(err.to_string().contains("max_line_bytes"), "{err}");
    }

    #[test]
    fn enforces_event_limit() {
        let mut decoder = SseDecoder::new(SseLimits {
            max_line_bytes: 1024,
            max_event_bytes: 6,
        });
        let err = decoder
            .push(b"data: abcd\ndata: efgh\n")
            .expect_err("event too large");
        assert!(err.to_string().contains("max_event_bytes"), "{err}");
    }
}
