use serde_json::Value;

/// Fields matched by free-text search.
pub const SEARCH_FIELDS: [&str; 3] = ["message", "service", "severity"];

/// Index mapping for event documents.
pub fn index_mapping_body() -> Value {
    serde_json::json!({
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "timestamp": { "type": "date" },
                "service": { "type": "keyword" },
                "severity": { "type": "keyword" },
                "message": { "type": "text" }
            }
        }
    })
}

/// `multi_match` over [`SEARCH_FIELDS`], or `match_all` for a blank query.
pub fn text_query(query: &str) -> Value {
    let query = query.trim();
    if query.is_empty() {
        return serde_json::json!({ "match_all": {} });
    }
    serde_json::json!({
        "multi_match": {
            "query": query,
            "fields": SEARCH_FIELDS
        }
    })
}

pub fn search_body(query: &str, size: usize) -> Value {
    serde_json::json!({
        "query": text_query(query),
        "sort": [
            { "timestamp": { "order": "desc" } }
        ],
        "size": size,
        "track_total_hits": true
    })
}

/// `hits.total` is a number on old clusters and `{ "value": n }` on newer ones.
pub fn total_hits(resp: &Value) -> u64 {
    match resp.pointer("/hits/total") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(total) => total.get("value").and_then(|v| v.as_u64()).unwrap_or(0),
        None => 0,
    }
}
