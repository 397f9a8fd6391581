use cc_domain::error::{Error, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::Store;

impl Store {
    pub fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(|e| Error::Store(e.to_string()))?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn all_settings(&self) -> Result<std::collections::HashMap<String, serde_json::Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .map_err(|e| Error::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |r| {
                let key: String = r.get(0)?;
                let value: String = r.get(1)?;
                Ok((key, value))
            })
            .map_err(|e| Error::Store(e.to_string()))?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            let (key, value) = row.map_err(|e| Error::Store(e.to_string()))?;
            out.insert(key, serde_json::from_str(&value)?);
        }
        Ok(out)
    }

    /// Write `seed` values for every key that doesn't already have a row.
    /// Called once at startup with the `[settings]` table loaded from
    /// configuration, so a fresh database boots with defaults while an
    /// existing one keeps whatever the user has already changed.
    pub fn seed_settings(&self, seed: &std::collections::HashMap<String, serde_json::Value>) -> Result<()> {
        for (key, value) in seed {
            if self.get_setting(key)?.is_none() {
                self.set_setting(key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("theme", &serde_json::json!("dark")).unwrap();
        assert_eq!(store.get_setting("theme").unwrap(), Some(serde_json::json!("dark")));
    }

    #[test]
    fn set_overwrites_existing_value() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("theme", &serde_json::json!("dark")).unwrap();
        store.set_setting("theme", &serde_json::json!("light")).unwrap();
        assert_eq!(store.get_setting("theme").unwrap(), Some(serde_json::json!("light")));
    }

    #[test]
    fn seed_does_not_clobber_existing_keys() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("theme", &serde_json::json!("dark")).unwrap();
        let mut seed = std::collections::HashMap::new();
        seed.insert("theme".to_string(), serde_json::json!("light"));
        seed.insert("autosave".to_string(), serde_json::json!(true));
        store.seed_settings(&seed).unwrap();
        assert_eq!(store.get_setting("theme").unwrap(), Some(serde_json::json!("dark")));
        assert_eq!(store.get_setting("autosave").unwrap(), Some(serde_json::json!(true)));
    }
}
