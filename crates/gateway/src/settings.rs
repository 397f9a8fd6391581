//! Runtime-mutable settings. `cc_store`'s key-value table is the override
//! layer; `cc_domain::config::Config`'s static fields are the fallback
//! layer used when a key has never been set. Changes broadcast
//! `settings_changed` globally via the caller (the WS handler), not from
//! here — this module only reads and writes the store.

use cc_domain::error::Result;
use cc_store::Store;
use serde_json::Value;

/// Settings the UI owns exclusively; a generic `settings.update` must
/// reject writes to these keys.
pub const UI_MANAGED_KEYS: &[&str] = &["auto_approve", "last_active_session_id"];

pub const DEFAULT_MODEL: &str = "default_model";
pub const VISION_MODEL: &str = "vision_model";
pub const VNC_COORDINATE_BACKEND: &str = "vnc_coordinate_backend";
pub const COMPACTION_VERBATIM_BUDGET: &str = "compaction_verbatim_budget";
pub const CONTEXT_COMPACTION_THRESHOLD: &str = "context_compaction_threshold";
pub const MESSAGES_PAGE_SIZE: &str = "messages_page_size";
pub const SYSTEM_PROMPT: &str = "system_prompt";

pub fn is_ui_managed(key: &str) -> bool {
    UI_MANAGED_KEYS.contains(&key)
}

fn get_int(store: &Store, key: &str) -> Result<Option<i64>> {
    Ok(store.get_setting(key)?.and_then(|v| v.as_i64()))
}

fn get_str(store: &Store, key: &str) -> Result<Option<String>> {
    Ok(store.get_setting(key)?.and_then(|v| v.as_str().map(str::to_string)))
}

pub fn default_model(store: &Store) -> Result<Option<String>> {
    get_str(store, DEFAULT_MODEL)
}

pub fn vision_model(store: &Store) -> Result<Option<String>> {
    get_str(store, VISION_MODEL)
}

pub fn vnc_coordinate_backend(store: &Store) -> Result<String> {
    Ok(get_str(store, VNC_COORDINATE_BACKEND)?.unwrap_or_else(|| "vision".to_string()))
}

pub fn system_prompt(store: &Store) -> Result<Option<String>> {
    Ok(get_str(store, SYSTEM_PROMPT)?.filter(|s| !s.is_empty()))
}

/// Pagination window for `messages.list`, clamped to [5, 200].
pub fn messages_page_size(store: &Store, default: usize) -> Result<usize> {
    match get_int(store, MESSAGES_PAGE_SIZE)? {
        Some(n) => Ok((n.clamp(5, 200)) as usize),
        None => Ok(default),
    }
}

/// Apply `compaction_verbatim_budget` (clamped [0, 50]) and
/// `context_compaction_threshold` (clamped [0, 100]) overrides onto a base
/// `CompactionConfig`, falling back to the static config when a key has
/// never been set.
pub fn resolved_compaction_config(
    store: &Store,
    base: &cc_domain::config::CompactionConfig,
) -> cc_domain::config::CompactionConfig {
    let mut config = base.clone();
    if let Ok(Some(pct)) = get_int(store, COMPACTION_VERBATIM_BUDGET) {
        config.verbatim_budget_percent = pct.clamp(0, 50) as u8;
    }
    if let Ok(Some(pct)) = get_int(store, CONTEXT_COMPACTION_THRESHOLD) {
        config.trigger_percent = pct.clamp(0, 100) as u8;
    }
    config
}

/// Write a settings update, rejecting UI-managed keys.
pub fn update(store: &Store, key: &str, value: &Value) -> Result<bool> {
    if is_ui_managed(key) {
        return Ok(false);
    }
    store.set_setting(key, value)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_managed_keys_are_rejected_by_update() {
        let store = Store::open_in_memory().unwrap();
        let ok = update(&store, "auto_approve", &serde_json::json!(true)).unwrap();
        assert!(!ok);
        assert_eq!(store.get_setting("auto_approve").unwrap(), None);
    }

    #[test]
    fn generic_key_updates_successfully() {
        let store = Store::open_in_memory().unwrap();
        assert!(update(&store, DEFAULT_MODEL, &serde_json::json!("openai/gpt-4o")).unwrap());
        assert_eq!(default_model(&store).unwrap().as_deref(), Some("openai/gpt-4o"));
    }

    #[test]
    fn messages_page_size_clamps_to_range() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting(MESSAGES_PAGE_SIZE, &serde_json::json!(1000)).unwrap();
        assert_eq!(messages_page_size(&store, 50).unwrap(), 200);
    }

    #[test]
    fn messages_page_size_falls_back_to_default_when_unset() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(messages_page_size(&store, 50).unwrap(), 50);
    }

    #[test]
    fn resolved_compaction_config_overrides_only_set_keys() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting(COMPACTION_VERBATIM_BUDGET, &serde_json::json!(10)).unwrap();
        let base = cc_domain::config::CompactionConfig::default();
        let resolved = resolved_compaction_config(&store, &base);
        assert_eq!(resolved.verbatim_budget_percent, 10);
        assert_eq!(resolved.trigger_percent, base.trigger_percent);
    }
}
