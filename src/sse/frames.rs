//! Frame extraction from the raw byte stream.
//!
//! `FrameParser` buffers incoming chunks and emits complete frames as they
//! become available. It does not interpret payloads; that is the
//! normalizer's job.

/// One complete protocol frame: the `id` / `event` / `data` triplet.
///
/// All fields are optional on the wire. Multiple `data:` lines within a
/// frame are joined with `\n` into a single payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
}

/// Classification of a single line within a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameLine {
    Id(String),
    Event(String),
    Data(String),
    Blank,
    /// Comment or unrecognized prefix; ignored, never fatal.
    Ignored,
}

fn parse_frame_line(line: &str) -> FrameLine {
    if line.is_empty() {
        return FrameLine::Blank;
    }

    if line.starts_with(':') {
        return FrameLine::Ignored;
    }

    if let Some(rest) = line.strip_prefix("id:") {
        return FrameLine::Id(rest.trim().to_string());
    }

    if let Some(rest) = line.strip_prefix("event:") {
        return FrameLine::Event(rest.trim().to_string());
    }

    if let Some(rest) = line.strip_prefix("data:") {
        return FrameLine::Data(rest.trim().to_string());
    }

    FrameLine::Ignored
}

/// Stateful frame parser fed with raw byte chunks.
///
/// Chunk boundaries carry no meaning: a frame may span several chunks and
/// one chunk may complete several frames. Bytes are buffered raw and a
/// line is only decoded once its terminator has arrived, so a multi-byte
/// character whose encoding straddles a chunk boundary survives intact.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    current: RawFrame,
    data_lines: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a byte chunk, returning every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..newline_pos]);

            if let Some(frame) = self.feed_line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush any trailing frame at end of stream (a final frame may lack
    /// its closing blank line when the server hangs up).
    pub fn finish(&mut self) -> Option<RawFrame> {
        if !self.buffer.is_empty() {
            let bytes = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&bytes);
            if let Some(frame) = self.feed_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.feed_line("")
    }

    /// Clear all buffered state, discarding any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.current = RawFrame::default();
        self.data_lines.clear();
    }

    fn feed_line(&mut self, line: &str) -> Option<RawFrame> {
        match parse_frame_line(line) {
            FrameLine::Id(id) => {
                self.current.id = Some(id);
                None
            }
            FrameLine::Event(name) => {
                self.current.event = Some(name);
                None
            }
            FrameLine::Data(data) => {
                self.data_lines.push(data);
                None
            }
            FrameLine::Ignored => None,
            FrameLine::Blank => {
                if self.current.id.is_none()
                    && self.current.event.is_none()
                    && self.data_lines.is_empty()
                {
                    return None;
                }

                let mut frame = std::mem::take(&mut self.current);
                if !self.data_lines.is_empty() {
                    frame.data = Some(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                Some(frame)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests for parse_frame_line

    #[test]
    fn test_parse_empty_line() {
        assert_eq!(parse_frame_line(""), FrameLine::Blank);
    }

    #[test]
    fn test_parse_comment_line() {
        assert_eq!(parse_frame_line(": keep-alive"), FrameLine::Ignored);
        assert_eq!(parse_frame_line(":"), FrameLine::Ignored);
    }

    #[test]
    fn test_parse_id_line() {
        assert_eq!(parse_frame_line("id: 42"), FrameLine::Id("42".to_string()));
        assert_eq!(parse_frame_line("id:42"), FrameLine::Id("42".to_string()));
    }

    #[test]
    fn test_parse_event_line() {
        assert_eq!(
            parse_frame_line("event: planner_stream"),
            FrameLine::Event("planner_stream".to_string())
        );
        assert_eq!(
            parse_frame_line("event:heartbeat"),
            FrameLine::Event("heartbeat".to_string())
        );
    }

    #[test]
    fn test_parse_data_line() {
        assert_eq!(
            parse_frame_line(r#"data: {"type":"event_batch"}"#),
            FrameLine::Data(r#"{"type":"event_batch"}"#.to_string())
        );
    }

    #[test]
    fn test_parse_unknown_prefix_ignored() {
        assert_eq!(parse_frame_line("retry: 3000"), FrameLine::Ignored);
        assert_eq!(parse_frame_line("garbage"), FrameLine::Ignored);
    }

    // Tests for FrameParser

    #[test]
    fn test_single_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"id: 7\nevent: heartbeat\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].event.as_deref(), Some("heartbeat"));
        assert_eq!(frames[0].data.as_deref(), Some("{}"));
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"event: planner_str").is_empty());
        assert!(parser.feed(b"eam\ndata: {\"a\"").is_empty());
        let frames = parser.feed(b":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("planner_stream"));
        assert_eq!(frames[0].data.as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let bytes = r#"event: planner_stream
data: {"summary":"café latte"}

"#
        .as_bytes();
        // Cut between the two bytes of the 'é' encoding.
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut parser = FrameParser::new();
        assert!(parser.feed(&bytes[..split]).is_empty());
        let frames = parser.feed(&bytes[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some(r#"{"summary":"café latte"}"#));
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"event: heartbeat\n\nevent: error\ndata: boom\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("heartbeat"));
        assert_eq!(frames[1].event.as_deref(), Some("error"));
        assert_eq!(frames[1].data.as_deref(), Some("boom"));
    }

    #[test]
    fn test_multiple_data_lines_joined() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"event: error\ndata: line one\ndata: line two\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"event: heartbeat\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn test_blank_lines_between_frames_do_not_emit() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"\n\n\nevent: heartbeat\n\n\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"bogus line\nevent: heartbeat\nretry: 1000\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn test_finish_flushes_trailing_frame() {
        let mut parser = FrameParser::new();
        // Server hangs up without a closing blank line.
        assert!(parser.feed(b"event: error\ndata: cut off").is_empty());
        let frame = parser.finish().expect("trailing frame");
        assert_eq!(frame.event.as_deref(), Some("error"));
        assert_eq!(frame.data.as_deref(), Some("cut off"));
    }

    #[test]
    fn test_finish_empty() {
        let mut parser = FrameParser::new();
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut parser = FrameParser::new();
        parser.feed(b"event: planner_stream\ndata: {\"partial\"");
        parser.reset();
        assert!(parser.feed(b"\n\n").is_empty());
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_id_only_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"id: 12\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("12"));
        assert!(frames[0].event.is_none());
        assert!(frames[0].data.is_none());
    }
}
