//! The `memory_search`/`memory_ingest` tool pair, backed by `cc-store`'s
//! `Memory` table rather than a RAG vector index — search is a plain
//! substring scan, which is sufficient at this scope and avoids pulling in
//! an embeddings dependency this crate has no other use for.

use cc_domain::error::Result;
use cc_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub content: String,
    /// When absent, the memory is global and visible to every session.
    #[serde(default)]
    pub session_scoped: bool,
}

#[derive(Debug, Clone, Serialize)]
struct SearchHit {
    id: String,
    content: String,
    session_id: Option<String>,
}

pub fn search(store: &Store, session_id: &str, req: SearchRequest) -> Result<Value> {
    let query = req.query.to_lowercase();
    let hits: Vec<SearchHit> = store
        .list_memories(session_id)?
        .into_iter()
        .filter(|m| m.content.to_lowercase().contains(&query))
        .take(req.limit)
        .map(|m| SearchHit { id: m.id, content: m.content, session_id: m.session_id })
        .collect();

    Ok(serde_json::json!({ "query": req.query, "results": hits, "count": hits.len() }))
}

pub fn ingest(store: &Store, session_id: &str, req: IngestRequest) -> Result<Value> {
    let scope = if req.session_scoped { Some(session_id) } else { None };
    let token_count = cc_domain::tokens::estimate_tokens(&req.content);
    let memory = store.create_memory(scope, &req.content, token_count)?;

    Ok(serde_json::json!({
        "id": memory.id,
        "session_id": memory.session_id,
        "token_count": memory.token_count,
        "success": true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_then_search_global_memory_from_any_session() {
        let store = Store::open_in_memory().unwrap();
        let s1 = store.create_session(None).unwrap();
        let s2 = store.create_session(None).unwrap();

        ingest(
            &store,
            &s1.id,
            IngestRequest { content: "the deploy key rotates every 90 days".into(), session_scoped: false },
        )
        .unwrap();

        let result = search(&store, &s2.id, SearchRequest { query: "deploy key".into(), limit: 10 }).unwrap();
        assert_eq!(result["count"].as_u64().unwrap(), 1);
    }

    #[test]
    fn session_scoped_memory_invisible_to_other_sessions() {
        let store = Store::open_in_memory().unwrap();
        let s1 = store.create_session(None).unwrap();
        let s2 = store.create_session(None).unwrap();

        ingest(&store, &s1.id, IngestRequest { content: "private note".into(), session_scoped: true }).unwrap();

        let own = search(&store, &s1.id, SearchRequest { query: "private".into(), limit: 10 }).unwrap();
        let other = search(&store, &s2.id, SearchRequest { query: "private".into(), limit: 10 }).unwrap();
        assert_eq!(own["count"].as_u64().unwrap(), 1);
        assert_eq!(other["count"].as_u64().unwrap(), 0);
    }
}
