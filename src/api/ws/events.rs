// src/api/ws/events.rs
// Compressed WebSocket event shapes.
//
// Every event is a JSON object with a `type` discriminator and short field
// keys. The two/three-letter discriminators and field names are the wire
// contract with the frontend: changes must be additive only.

use serde_json::{Value, json};

pub fn chat_token(token: &str, message_id: &str) -> Value {
    json!({ "type": "ct", "t": token, "mid": message_id })
}

pub fn reasoning_token(token: &str) -> Value {
    json!({ "type": "rt", "t": token })
}

pub fn reasoning_complete() -> Value {
    json!({ "type": "rc" })
}

pub fn tool_call_start(tool: &str, args: &Value) -> Value {
    json!({ "type": "tcs", "tl": tool, "a": args })
}

pub fn query_progress(query_number: u32) -> Value {
    json!({ "type": "qp", "n": query_number })
}

pub fn query_status(phase: &str) -> Value {
    json!({ "type": "qs", "p": phase })
}

pub fn chart_spec(execution_index: i64, spec: &Value) -> Value {
    json!({ "type": "cs", "ei": execution_index, "sp": spec })
}

pub fn followup_suggestions(suggestions: &[String]) -> Value {
    json!({ "type": "fs", "sg": suggestions })
}

pub fn rate_limit_warning(usage_percent: f64, remaining_tokens: i64) -> Value {
    json!({ "type": "rlw", "up": usage_percent, "rt": remaining_tokens })
}

pub fn rate_limit_exceeded(resets_in_seconds: Option<i64>) -> Value {
    json!({ "type": "rle", "rs": resets_in_seconds })
}

#[allow(clippy::too_many_arguments)]
pub fn chat_complete(
    message_id: &str,
    sql_query: Option<&str>,
    token_count: i64,
    sql_executions: Option<&Value>,
    reasoning: Option<&str>,
    input_tokens: i64,
    output_tokens: i64,
    tool_call_trace: Option<&Value>,
) -> Value {
    let mut event = json!({
        "type": "cc",
        "mid": message_id,
        "tc": token_count,
        "se": sql_executions.cloned().unwrap_or_else(|| json!([])),
        "it": input_tokens,
        "ot": output_tokens,
    });
    if let Some(sql) = sql_query {
        if !sql.is_empty() {
            event["sq"] = json!(sql);
        }
    }
    if let Some(reasoning) = reasoning {
        if !reasoning.is_empty() {
            event["r"] = json!(reasoning);
        }
    }
    if let Some(trace) = tool_call_trace {
        event["tct"] = trace.clone();
    }
    event
}

pub fn chat_error(error: &str, details: Option<&str>) -> Value {
    let mut event = json!({ "type": "ce", "e": error });
    if let Some(details) = details {
        event["d"] = json!(details);
    }
    event
}

pub fn dataset_loading(dataset_id: &str) -> Value {
    json!({ "type": "dl", "did": dataset_id })
}

pub fn dataset_loaded(dataset: &Value) -> Value {
    json!({ "type": "dld", "ds": dataset })
}

pub fn dataset_error(dataset_id: &str, error: &str) -> Value {
    json!({ "type": "de", "did": dataset_id, "e": error })
}

pub fn dataset_profiled(dataset_id: &str, profiles: &Value) -> Value {
    json!({ "type": "dp", "did": dataset_id, "pf": profiles })
}

pub fn conversation_title_updated(conversation_id: &str, title: &str) -> Value {
    json!({ "type": "ctu", "cid": conversation_id, "t": title })
}

pub fn usage_update(usage_tokens: i64, remaining_tokens: i64) -> Value {
    json!({ "type": "uu", "ut": usage_tokens, "rt": remaining_tokens })
}
