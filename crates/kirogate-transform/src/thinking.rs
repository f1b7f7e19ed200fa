//! Streaming extraction of `<thinking>...</thinking>` blocks.
//!
//! The extractor is a small state machine over text deltas. It buffers just
//! enough input to decide whether the buffer contains, starts or ends a
//! reasoning block, never emits a partial UTF-8 codepoint, and never looks
//! ahead more than one tag length.

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

/// Characters that mark a tag occurrence as quoted rather than real.
const QUOTE_CHARS: &[u8] = &[
    b'`', b'"', b'\'', b'\\', b'#', b'[', b']', b'(', b')', b'{', b'}',
];

fn is_quote_char(byte: u8) -> bool {
    QUOTE_CHARS.contains(&byte)
}

/// Snap `target` back to the nearest UTF-8 codepoint boundary in `s`.
fn char_boundary(s: &str, target: usize) -> usize {
    if target >= s.len() {
        return s.len();
    }
    let mut idx = target;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// True when the buffer prefix `[0, idx)` contains an odd number of
/// backticks, i.e. position `idx` sits inside a Markdown inline-code span.
fn inside_code_span(buffer: &str, idx: usize) -> bool {
    buffer.as_bytes()[..idx].iter().filter(|b| **b == b'`').count() % 2 == 1
}

/// Find a real open tag, stepping over quoted and code-span occurrences.
fn find_open_tag(buffer: &str) -> Option<usize> {
    let mut search = 0;
    loop {
        let idx = buffer[search..].find(OPEN_TAG)? + search;

        if idx > 0 && is_quote_char(buffer.as_bytes()[idx - 1]) {
            search = idx + OPEN_TAG.len();
            continue;
        }
        let after = idx + OPEN_TAG.len();
        if after < buffer.len() && is_quote_char(buffer.as_bytes()[after]) {
            search = after;
            continue;
        }
        if inside_code_span(buffer, idx) {
            search = idx + OPEN_TAG.len();
            continue;
        }
        return Some(idx);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMatch {
    Found(usize),
    /// A candidate is followed by a single `\n`; more input is needed to
    /// tell `\n\n` from a false positive.
    NeedMore,
    NotFound,
}

/// Find a real close tag. A close tag counts only when followed by `\n\n`
/// (or the end of the buffer).
fn find_close_tag(buffer: &str) -> CloseMatch {
    let mut search = 0;
    loop {
        let Some(rel) = buffer[search..].find(CLOSE_TAG) else {
            return CloseMatch::NotFound;
        };
        let idx = rel + search;

        if idx > 0 && is_quote_char(buffer.as_bytes()[idx - 1]) {
            search = idx + CLOSE_TAG.len();
            continue;
        }
        let after = idx + CLOSE_TAG.len();
        if after < buffer.len() && is_quote_char(buffer.as_bytes()[after]) {
            search = after;
            continue;
        }
        if inside_code_span(buffer, idx) {
            search = idx + CLOSE_TAG.len();
            continue;
        }

        let remaining = &buffer[after..];
        if remaining.len() >= 2 {
            if !remaining.starts_with("\n\n") {
                search = after;
                continue;
            }
        } else if remaining.len() == 1 {
            if remaining.as_bytes()[0] == b'\n' {
                return CloseMatch::NeedMore;
            }
            search = after;
            continue;
        } else {
            // Tag sits at the end of the buffer: wait until the following
            // bytes confirm or refute the required blank line.
            return CloseMatch::NeedMore;
        }
        return CloseMatch::Found(idx);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotInThinking,
    InThinking,
    Extracted,
}

/// Output of one extractor step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    pub thinking: String,
    pub text: String,
    pub thinking_started: bool,
    pub thinking_ended: bool,
}

impl ChunkOutcome {
    pub fn is_empty(&self) -> bool {
        self.thinking.is_empty()
            && self.text.is_empty()
            && !self.thinking_started
            && !self.thinking_ended
    }
}

/// Per-request extractor state, including the content block index contract:
/// with thinking enabled the thinking block is index 0 and the first text
/// block index 1, otherwise text starts at 0; tool blocks allocate from the
/// running counter.
#[derive(Debug)]
pub struct ThinkingExtractor {
    enabled: bool,
    state: State,
    buffer: String,
    thinking_block: Option<u32>,
    text_block: u32,
    next_block: u32,
}

impl ThinkingExtractor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: State::NotInThinking,
            buffer: String::new(),
            thinking_block: enabled.then_some(0),
            text_block: if enabled { 1 } else { 0 },
            next_block: if enabled { 2 } else { 1 },
        }
    }

    pub fn thinking_block_index(&self) -> Option<u32> {
        self.thinking_block
    }

    pub fn text_block_index(&self) -> u32 {
        self.text_block
    }

    /// Allocate the next content block index (tool-use blocks).
    pub fn allocate_block_index(&mut self) -> u32 {
        let idx = self.next_block;
        self.next_block += 1;
        idx
    }

    pub fn is_in_thinking(&self) -> bool {
        self.state == State::InThinking
    }

    pub fn process_chunk(&mut self, chunk: &str) -> ChunkOutcome {
        if !self.enabled {
            return ChunkOutcome {
                text: chunk.to_string(),
                ..Default::default()
            };
        }

        self.buffer.push_str(chunk);
        match self.state {
            State::NotInThinking => self.process_not_in_thinking(),
            State::InThinking => self.process_in_thinking(),
            State::Extracted => ChunkOutcome {
                text: std::mem::take(&mut self.buffer),
                ..Default::default()
            },
        }
    }

    fn process_not_in_thinking(&mut self) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();

        if let Some(start) = find_open_tag(&self.buffer) {
            self.state = State::InThinking;
            outcome.thinking_started = true;
            if start > 0 {
                outcome.text = self.buffer[..start].to_string();
            }
            self.buffer.drain(..start + OPEN_TAG.len());
            // The tail after the tag may already hold thinking content.
            let mut rest = self.process_in_thinking();
            outcome.thinking = std::mem::take(&mut rest.thinking);
            if !rest.text.is_empty() {
                outcome.text.push_str(&rest.text);
            }
            outcome.thinking_ended = rest.thinking_ended;
            return outcome;
        }

        // No open tag: emit everything except a possible partial tag tail.
        if self.buffer.len() + 1 > OPEN_TAG.len() {
            let safe = char_boundary(&self.buffer, self.buffer.len() - (OPEN_TAG.len() - 1));
            if safe > 0 {
                outcome.text = self.buffer[..safe].to_string();
                self.buffer.drain(..safe);
            }
        }
        outcome
    }

    fn process_in_thinking(&mut self) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();

        match find_close_tag(&self.buffer) {
            CloseMatch::Found(end) => {
                outcome.thinking = self.buffer[..end].to_string();
                outcome.thinking_ended = true;
                self.state = State::Extracted;

                let mut rest = &self.buffer[end + CLOSE_TAG.len()..];
                if let Some(stripped) = rest.strip_prefix("\n\n") {
                    rest = stripped;
                } else if let Some(stripped) = rest.strip_prefix('\n') {
                    rest = stripped;
                }
                outcome.text = rest.to_string();
                self.buffer.clear();
            }
            CloseMatch::NeedMore => {}
            CloseMatch::NotFound => {
                if self.buffer.len() + 1 > CLOSE_TAG.len() {
                    let safe =
                        char_boundary(&self.buffer, self.buffer.len() - (CLOSE_TAG.len() - 1));
                    if safe > 0 {
                        outcome.thinking = self.buffer[..safe].to_string();
                        self.buffer.drain(..safe);
                    }
                }
            }
        }
        outcome
    }

    /// Drain whatever is left at stream end: thinking content when still
    /// inside a block, text otherwise.
    pub fn flush(&mut self) -> ChunkOutcome {
        let residual = std::mem::take(&mut self.buffer);
        if residual.is_empty() {
            return ChunkOutcome::default();
        }
        match self.state {
            State::InThinking => ChunkOutcome {
                thinking: residual,
                ..Default::default()
            },
            _ => ChunkOutcome {
                text: residual,
                ..Default::default()
            },
        }
    }
}
