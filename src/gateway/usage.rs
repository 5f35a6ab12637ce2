//! Usage: Token-usage extraction from upstream responses (SSE streams and
//! plain JSON bodies), one parser per dialect.

use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct UsageAccumulator {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
    pub reasoning_tokens: i64,
}

fn get_i64(value: &Value, path: &[&str]) -> i64 {
    let mut current = value;
    for key in path {
        match current.get(key) {
            Some(next) => current = next,
            None => return 0,
        }
    }
    current.as_i64().unwrap_or(0)
}

impl UsageAccumulator {
    pub(crate) fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Anthropic-Messages events: `message.usage.*` on `message_start`, plus
    /// top-level `usage.*` deltas. Additive across events.
    pub(crate) fn apply_claude_payload(&mut self, data: &str) {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        self.input_tokens += get_i64(&value, &["message", "usage", "input_tokens"]);
        self.output_tokens += get_i64(&value, &["message", "usage", "output_tokens"]);
        self.cache_create_tokens +=
            get_i64(&value, &["message", "usage", "cache_creation_input_tokens"]);
        self.cache_read_tokens +=
            get_i64(&value, &["message", "usage", "cache_read_input_tokens"]);

        self.input_tokens += get_i64(&value, &["usage", "input_tokens"]);
        self.output_tokens += get_i64(&value, &["usage", "output_tokens"]);
    }

    /// OpenAI-Responses events: `response.usage.*`. Additive across events.
    pub(crate) fn apply_codex_payload(&mut self, data: &str) {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        self.input_tokens += get_i64(&value, &["response", "usage", "input_tokens"]);
        self.output_tokens += get_i64(&value, &["response", "usage", "output_tokens"]);
        self.cache_read_tokens += get_i64(
            &value,
            &["response", "usage", "input_tokens_details", "cached_tokens"],
        );
        self.reasoning_tokens += get_i64(
            &value,
            &[
                "response",
                "usage",
                "output_tokens_details",
                "reasoning_tokens",
            ],
        );
    }

    /// Gemini streams cumulative totals in every chunk, so fields merge by
    /// maximum rather than by sum. When only `totalTokenCount` is reported,
    /// output is synthesized as total − prompt.
    pub(crate) fn apply_gemini_payload(&mut self, data: &str) {
        // Cheap pre-filter: most chunks carry no usage at all.
        if !data.contains("usageMetadata") {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        let Some(usage) = value.get("usageMetadata") else {
            return;
        };

        let prompt = get_i64(usage, &["promptTokenCount"]);
        let candidates = get_i64(usage, &["candidatesTokenCount"]);
        let cached = get_i64(usage, &["cachedContentTokenCount"]);
        let thoughts = get_i64(usage, &["thoughtsTokenCount"]);

        self.input_tokens = self.input_tokens.max(prompt);
        self.output_tokens = self.output_tokens.max(candidates);
        self.cache_read_tokens = self.cache_read_tokens.max(cached);
        self.reasoning_tokens = self.reasoning_tokens.max(thoughts);

        let total = get_i64(usage, &["totalTokenCount"]);
        if total > 0
            && self.output_tokens == 0
            && self.input_tokens > 0
            && self.input_tokens < total
        {
            self.output_tokens = total - self.input_tokens;
        }
    }
}

/// Cross-chunk SSE accumulator. Events are only dispatched once their blank-
/// line terminator (`\n\n` or `\r\n\r\n`) has arrived, so a usage payload
/// straddling a TCP boundary is never lost.
pub(crate) struct SseUsageTracker {
    buffer: String,
    saw_sse_event: bool,
}

impl SseUsageTracker {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            saw_sse_event: false,
        }
    }

    pub(crate) fn ingest_chunk(
        &mut self,
        chunk: &[u8],
        apply: &mut dyn FnMut(&str),
    ) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        loop {
            let Some((event_end, sep_len)) = find_event_boundary(&self.buffer) else {
                break;
            };
            let event: String = self.buffer.drain(..event_end + sep_len).collect();
            self.dispatch_event(&event, apply);
        }
    }

    /// Flush whatever is still buffered at EOF (a final event may lack its
    /// terminator).
    pub(crate) fn finish(&mut self, apply: &mut dyn FnMut(&str)) {
        if self.buffer.is_empty() {
            return;
        }
        let event = std::mem::take(&mut self.buffer);
        self.dispatch_event(&event, apply);
    }

    /// Whether any `data:` line was observed; callers fall back to whole-body
    /// JSON parsing when a 2xx response turned out not to be SSE after all.
    pub(crate) fn saw_sse_event(&self) -> bool {
        self.saw_sse_event
    }

    fn dispatch_event(&mut self, event: &str, apply: &mut dyn FnMut(&str)) {
        for line in event.lines() {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            self.saw_sse_event = true;
            apply(data);
        }
    }
}

fn find_event_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n");
    let crlf = buffer.find("\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, 4)),
        (Some(a), _) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::dialect::Dialect;

    fn track(dialect: Dialect, chunks: &[&str]) -> UsageAccumulator {
        let mut acc = UsageAccumulator::default();
        let mut tracker = SseUsageTracker::new();
        for chunk in chunks {
            tracker.ingest_chunk(chunk.as_bytes(), &mut |data| {
                dialect.apply_usage_payload(data, &mut acc)
            });
        }
        tracker.finish(&mut |data| dialect.apply_usage_payload(data, &mut acc));
        acc
    }

    #[test]
    fn claude_usage_is_additive_across_events() {
        let acc = track(
            Dialect::Claude,
            &[
                "event: message_start\ndata: {\"message\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":1,\"cache_creation_input_tokens\":3,\"cache_read_input_tokens\":7}}}\n\n",
                "event: message_delta\ndata: {\"usage\":{\"output_tokens\":4}}\n\n",
            ],
        );
        assert_eq!(acc.input_tokens, 10);
        assert_eq!(acc.output_tokens, 5);
        assert_eq!(acc.cache_create_tokens, 3);
        assert_eq!(acc.cache_read_tokens, 7);
    }

    #[test]
    fn codex_usage_reads_response_usage_details() {
        let acc = track(
            Dialect::Codex,
            &[
                "data: {\"response\":{\"usage\":{\"input_tokens\":100,\"output_tokens\":20,\"input_tokens_details\":{\"cached_tokens\":80},\"output_tokens_details\":{\"reasoning_tokens\":12}}}}\n\n",
                "data: [DONE]\n\n",
            ],
        );
        assert_eq!(acc.input_tokens, 100);
        assert_eq!(acc.output_tokens, 20);
        assert_eq!(acc.cache_read_tokens, 80);
        assert_eq!(acc.reasoning_tokens, 12);
    }

    #[test]
    fn gemini_usage_merges_by_maximum_not_sum() {
        let acc = track(
            Dialect::Gemini,
            &[
                "data: {\"usageMetadata\":{\"promptTokenCount\":50,\"candidatesTokenCount\":5}}\n\n",
                "data: {\"usageMetadata\":{\"promptTokenCount\":50,\"candidatesTokenCount\":25,\"thoughtsTokenCount\":9}}\n\n",
            ],
        );
        assert_eq!(acc.input_tokens, 50);
        assert_eq!(acc.output_tokens, 25);
        assert_eq!(acc.reasoning_tokens, 9);
    }

    #[test]
    fn gemini_total_only_synthesizes_output() {
        let acc = track(
            Dialect::Gemini,
            &["data: {\"usageMetadata\":{\"promptTokenCount\":40,\"totalTokenCount\":65}}\n\n"],
        );
        assert_eq!(acc.input_tokens, 40);
        assert_eq!(acc.output_tokens, 25);
    }

    #[test]
    fn event_straddling_chunk_boundary_is_parsed_once_complete() {
        let acc = track(
            Dialect::Gemini,
            &[
                "data: {\"usageMetadata\":{\"promptT",
                "okenCount\":33,\"candidatesTokenCount\":4}}\n",
                "\n",
            ],
        );
        assert_eq!(acc.input_tokens, 33);
        assert_eq!(acc.output_tokens, 4);
    }

    #[test]
    fn crlf_terminators_are_honored() {
        let acc = track(
            Dialect::Claude,
            &["data: {\"usage\":{\"input_tokens\":3,\"output_tokens\":2}}\r\n\r\n"],
        );
        assert_eq!(acc.input_tokens, 3);
        assert_eq!(acc.output_tokens, 2);
    }

    #[test]
    fn unterminated_final_event_is_flushed_at_eof() {
        let acc = track(
            Dialect::Claude,
            &["data: {\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}"],
        );
        assert_eq!(acc.input_tokens, 1);
        assert_eq!(acc.output_tokens, 1);
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let acc = track(Dialect::Claude, &["data: {not json}\n\n", ": comment\n\n"]);
        assert!(acc.is_empty());
    }

    #[test]
    fn non_sse_body_reports_no_events() {
        let mut tracker = SseUsageTracker::new();
        let mut acc = UsageAccumulator::default();
        tracker.ingest_chunk(b"{\"usage\":{\"input_tokens\":10}}", &mut |data| {
            Dialect::Claude.apply_usage_payload(data, &mut acc)
        });
        assert!(!tracker.saw_sse_event());
    }

    #[test]
    fn whole_body_json_parse_matches_s1() {
        let mut acc = UsageAccumulator::default();
        acc.apply_claude_payload(
            "{\"content\":[],\"usage\":{\"input_tokens\":10,\"output_tokens\":5}}",
        );
        assert_eq!(acc.input_tokens, 10);
        assert_eq!(acc.output_tokens, 5);
    }
}
