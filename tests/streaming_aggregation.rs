//! Integration tests for SSE framing and stream aggregation
//!
//! Feeds raw byte streams through the SSE parser, the OpenAI-format delta
//! parser and the streaming context together, with chunk boundaries placed
//! deliberately badly: mid-line, mid-JSON-token and mid-tag.

use modelgate::providers::openai_compat::parse_chat_stream_delta;
use modelgate::providers::SseParser;
use modelgate::streaming::{RunnerOutput, StreamingContext, ThinkTagStreamingContext};

fn aggregate(byte_chunks: &[&[u8]]) -> RunnerOutput {
    let mut parser = SseParser::new(false);
    let mut ctx = StreamingContext::new();
    for chunk in byte_chunks {
        for payload in parser.push(chunk) {
            let parsed = parse_chat_stream_delta(&payload).unwrap();
            ctx.add_chunk(parsed).unwrap();
        }
    }
    ctx.complete(|text, reasoning, tool_calls| RunnerOutput {
        text,
        reasoning,
        tool_calls,
    })
    .unwrap()
    .final_output
    .unwrap()
}

#[test]
fn test_clean_event_stream() {
    let output = aggregate(&[
        b"data: {\"choices\":[{\"delta\":{\"content\":\"The meaning \"}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{\"content\":\"of life is 42\"}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        b"data: [DONE]\n\n",
    ]);
    assert_eq!(output.text, "The meaning of life is 42");
    assert!(output.tool_calls.is_empty());
}

#[test]
fn test_chunk_boundary_splits_json_mid_token() {
    // The same stream, but cut inside the JSON string escape and inside the
    // `data: ` prefix
    let output = aggregate(&[
        b"data: {\"choices\":[{\"delta\":{\"content\":\"The mea",
        b"ning \"}}]}\nda",
        b"ta: {\"choices\":[{\"delta\":{\"content\":\"of life is 42\"}}]}\n\n",
        b"data: [DONE]\n\n",
    ]);
    assert_eq!(output.text, "The meaning of life is 42");
}

#[test]
fn test_tool_call_arguments_split_across_events() {
    let output = aggregate(&[
        b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"{\\\"ci\"}}]}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"ty\\\":\\\"Paris\\\"}\"}}]}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        b"data: [DONE]\n\n",
    ]);
    assert_eq!(output.tool_calls.len(), 1);
    assert_eq!(output.tool_calls[0].tool_name, "get_weather");
    assert_eq!(output.tool_calls[0].tool_input["city"], "Paris");
}

#[test]
fn test_usage_only_final_chunk_is_not_lost() {
    let mut parser = SseParser::new(false);
    let mut ctx = StreamingContext::new();
    for chunk in [
        &b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"[..],
        &b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":2}}\n\n"[..],
    ] {
        for payload in parser.push(chunk) {
            ctx.add_chunk(parse_chat_stream_delta(&payload).unwrap()).unwrap();
        }
    }
    assert_eq!(ctx.usage().prompt_token_count, Some(10.0));
    assert_eq!(ctx.usage().completion_token_count, Some(2.0));
}

#[test]
fn test_think_tags_with_hostile_chunk_boundaries() {
    let mut parser = SseParser::new(false);
    let mut ctx = ThinkTagStreamingContext::new();
    let chunks: &[&[u8]] = &[
        b"data: {\"choices\":[{\"delta\":{\"content\":\"<thi\"}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{\"content\":\"nk>let me think\"}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{\"content\":\" harder</think>The answer\"}}]}\n\n",
        b"data: {\"choices\":[{\"delta\":{\"content\":\" is 42\"}}]}\n\n",
        b"data: [DONE]\n\n",
    ];
    for chunk in chunks {
        for payload in parser.push(chunk) {
            ctx.add_chunk(parse_chat_stream_delta(&payload).unwrap()).unwrap();
        }
    }
    let output = ctx
        .complete(|text, reasoning, tool_calls| RunnerOutput {
            text,
            reasoning,
            tool_calls,
        })
        .unwrap()
        .final_output
        .unwrap();
    assert_eq!(output.reasoning.as_deref(), Some("let me think harder"));
    assert_eq!(output.text, "The answer is 42");
}

#[test]
fn test_stream_sum_equals_final_text() {
    let mut parser = SseParser::new(false);
    let mut ctx = StreamingContext::new();
    let mut relayed = String::new();
    let chunks: &[&[u8]] = &[
        b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
        b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        b"data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n",
    ];
    for chunk in chunks {
        for payload in parser.push(chunk) {
            let relayed_chunk = ctx
                .add_chunk(parse_chat_stream_delta(&payload).unwrap())
                .unwrap();
            relayed.push_str(relayed_chunk.delta.as_deref().unwrap_or(""));
        }
    }
    let output = ctx
        .complete(|text, reasoning, tool_calls| RunnerOutput {
            text,
            reasoning,
            tool_calls,
        })
        .unwrap()
        .final_output
        .unwrap();
    assert_eq!(relayed, output.text);
    assert_eq!(output.text, "abc");
}
