//! `<thinking>` fence splitter for prompt-injected reasoning.
//!
//! When thinking is requested via system-prompt instructions the upstream
//! streams the reasoning inline, fenced in `<thinking>…</thinking>`. The
//! splitter is an explicit four-state machine that only releases
//! characters once they cannot be part of a half-arrived tag, so a fence
//! split across arbitrary chunk boundaries never leaks into the text
//! channel.

/// Fixed instruction template prepended to the system prompt when thinking
/// is enabled for a request.
pub const THINKING_PROMPT: &str = "Before answering, reason through the problem inside \
<thinking></thinking> tags. The thinking content is shown to the user as reasoning, \
separate from your answer. Close the tag before writing the final answer.";

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    PartialOpen,
    Inside,
    PartialClose,
}

/// A released span of the stream, routed to either the text block or the
/// thinking block.
#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    Text(String),
    Thinking(String),
}

#[derive(Debug)]
pub struct ThinkingSplitter {
    state: State,
    pending: String,
}

impl Default for ThinkingSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Length in bytes of the longest suffix of `s` that is a proper prefix of
/// `tag`. Tags are ASCII, so any matching suffix sits on a char boundary.
fn partial_tag_suffix(s: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(s.len());
    for k in (1..=max).rev() {
        if !s.is_char_boundary(s.len() - k) {
            continue;
        }
        if tag.as_bytes().starts_with(&s.as_bytes()[s.len() - k..]) {
            return k;
        }
    }
    0
}

impl ThinkingSplitter {
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            pending: String::new(),
        }
    }

    /// Feed a chunk, returning every span that is now safe to release.
    pub fn feed(&mut self, chunk: &str) -> Vec<Piece> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();

        loop {
            match self.state {
                State::Outside | State::PartialOpen => {
                    if let Some(idx) = self.pending.find(OPEN_TAG) {
                        if idx > 0 {
                            out.push(Piece::Text(self.pending[..idx].to_string()));
                        }
                        self.pending.drain(..idx + OPEN_TAG.len());
                        self.state = State::Inside;
                        continue;
                    }
                    let keep = partial_tag_suffix(&self.pending, OPEN_TAG);
                    let release = self.pending.len() - keep;
                    if release > 0 {
                        out.push(Piece::Text(self.pending[..release].to_string()));
                        self.pending.drain(..release);
                    }
                    self.state = if keep > 0 {
                        State::PartialOpen
                    } else {
                        State::Outside
                    };
                    break;
                }
                State::Inside | State::PartialClose => {
                    if let Some(idx) = self.pending.find(CLOSE_TAG) {
                        if idx > 0 {
                            out.push(Piece::Thinking(self.pending[..idx].to_string()));
                        }
                        self.pending.drain(..idx + CLOSE_TAG.len());
                        self.state = State::Outside;
                        continue;
                    }
                    let keep = partial_tag_suffix(&self.pending, CLOSE_TAG);
                    let release = self.pending.len() - keep;
                    if release > 0 {
                        out.push(Piece::Thinking(self.pending[..release].to_string()));
                        self.pending.drain(..release);
                    }
                    self.state = if keep > 0 {
                        State::PartialClose
                    } else {
                        State::Inside
                    };
                    break;
                }
            }
        }

        out
    }

    /// Flush whatever is buffered at stream end, honoring the current
    /// state: a half-open tag outside a fence was ordinary text after all;
    /// inside a fence everything buffered belongs to the thinking block.
    pub fn finish(self) -> Vec<Piece> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        match self.state {
            State::Outside | State::PartialOpen => vec![Piece::Text(self.pending)],
            State::Inside | State::PartialClose => vec![Piece::Thinking(self.pending)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&str]) -> Vec<Piece> {
        let mut sp = ThinkingSplitter::new();
        let mut out = Vec::new();
        for c in chunks {
            out.extend(sp.feed(c));
        }
        out.extend(sp.finish());
        out
    }

    fn joined(pieces: &[Piece]) -> (String, String) {
        let mut thinking = String::new();
        let mut text = String::new();
        for p in pieces {
            match p {
                Piece::Thinking(t) => thinking.push_str(t),
                Piece::Text(t) => text.push_str(t),
            }
        }
        (thinking, text)
    }

    #[test]
    fn fence_split_across_three_chunks() {
        let pieces = collect(&["<thi", "nking>plan</thinki", "ng>answer"]);
        let (thinking, text) = joined(&pieces);
        assert_eq!(thinking, "plan");
        assert_eq!(text, "answer");
    }

    #[test]
    fn no_fence_is_all_text() {
        let pieces = collect(&["just ", "a plain ", "answer"]);
        let (thinking, text) = joined(&pieces);
        assert!(thinking.is_empty());
        assert_eq!(text, "just a plain answer");
    }

    #[test]
    fn lone_angle_bracket_is_released_as_text() {
        let pieces = collect(&["a < b and a > b"]);
        let (thinking, text) = joined(&pieces);
        assert!(thinking.is_empty());
        assert_eq!(text, "a < b and a > b");
    }

    #[test]
    fn unterminated_fence_flushes_as_thinking() {
        let pieces = collect(&["<thinking>never closed"]);
        let (thinking, text) = joined(&pieces);
        assert_eq!(thinking, "never closed");
        assert!(text.is_empty());
    }

    #[test]
    fn half_open_tag_at_stream_end_was_text() {
        let pieces = collect(&["answer <think"]);
        let (thinking, text) = joined(&pieces);
        assert!(thinking.is_empty());
        assert_eq!(text, "answer <think");
    }

    #[test]
    fn text_before_and_after_fence() {
        let pieces = collect(&["pre<thinking>mid</thinking>post"]);
        let (thinking, text) = joined(&pieces);
        assert_eq!(thinking, "mid");
        assert_eq!(text, "prepost");
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let input = "x<thinking>abc</thinking>y";
        let chunks: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let (thinking, text) = joined(&collect(&refs));
        assert_eq!(thinking, "abc");
        assert_eq!(text, "xy");
    }

    #[test]
    fn multibyte_text_around_tags() {
        let pieces = collect(&["日本<thinking>思考</thinking>語"]);
        let (thinking, text) = joined(&pieces);
        assert_eq!(thinking, "思考");
        assert_eq!(text, "日本語");
    }
}
