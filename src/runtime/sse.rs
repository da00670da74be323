//! Incremental parser for the Messages API event stream.

use serde_json::Value;

/// One decoded stream event. Unknown event types are dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// A content block opened; `block` is its initial JSON.
    BlockStart {
        index: usize,
        block: Value,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    ThinkingDelta {
        index: usize,
        thinking: String,
    },
    SignatureDelta {
        index: usize,
        signature: String,
    },
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    BlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<String>,
        output_tokens: Option<u64>,
    },
    MessageStop,
    Error {
        message: String,
    },
}

/// Buffers bytes and yields complete events.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feeds a chunk and drains every complete frame.
    ///
    /// Chunks may split frames (and UTF-8 sequences) anywhere.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((end, sep_len)) = frame_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            let frame = String::from_utf8_lossy(&frame);

            if let Some(payload) = extract_data_payload(&frame) {
                if payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => events.extend(map_event(&value)),
                    Err(e) => tracing::debug!(error = %e, "skipping malformed stream frame"),
                }
            }
        }

        events
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

/// Position and length of the first blank-line separator.
fn frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn index_of(value: &Value) -> usize {
    value.get("index").and_then(Value::as_u64).unwrap_or(0) as usize
}

fn str_at(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn map_event(value: &Value) -> Option<StreamEvent> {
    let event_type = value.get("type")?.as_str()?;

    match event_type {
        "message_start" => {
            let usage = value.get("message").and_then(|m| m.get("usage"));
            let tokens = |key: &str| {
                usage
                    .and_then(|u| u.get(key))
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
            };
            Some(StreamEvent::MessageStart {
                input_tokens: tokens("input_tokens")
                    + tokens("cache_creation_input_tokens")
                    + tokens("cache_read_input_tokens"),
                output_tokens: tokens("output_tokens"),
            })
        }
        "content_block_start" => Some(StreamEvent::BlockStart {
            index: index_of(value),
            block: value.get("content_block").cloned().unwrap_or(Value::Null),
        }),
        "content_block_delta" => {
            let index = index_of(value);
            let delta = value.get("delta")?;
            match delta.get("type")?.as_str()? {
                "text_delta" => Some(StreamEvent::TextDelta {
                    index,
                    text: str_at(delta, "text"),
                }),
                "thinking_delta" => Some(StreamEvent::ThinkingDelta {
                    index,
                    thinking: str_at(delta, "thinking"),
                }),
                "signature_delta" => Some(StreamEvent::SignatureDelta {
                    index,
                    signature: str_at(delta, "signature"),
                }),
                "input_json_delta" => Some(StreamEvent::InputJsonDelta {
                    index,
                    partial_json: str_at(delta, "partial_json"),
                }),
                _ => None,
            }
        }
        "content_block_stop" => Some(StreamEvent::BlockStop {
            index: index_of(value),
        }),
        "message_delta" => Some(StreamEvent::MessageDelta {
            stop_reason: value
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            output_tokens: value
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(Value::as_u64),
        }),
        "message_stop" => Some(StreamEvent::MessageStop),
        "error" => Some(StreamEvent::Error {
            message: value
                .get("error")
                .map(|e| format!("{}: {}", str_at(e, "type"), str_at(e, "message")))
                .unwrap_or_else(|| "unknown stream error".to_string()),
        }),
        _ => None,
    }
}
