// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-only, wipeable view of decrypted plaintext returned from `getData`.
//!
//! A wrapper owning the decrypted payload plus a `cleared` flag, whose
//! accessors fail with [`Error::Locked`] once wiped.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub struct SecureDataView {
    payload: Value,
    cleared: bool,
}

impl SecureDataView {
    pub(crate) fn new(payload: Value) -> Self {
        Self {
            payload,
            cleared: false,
        }
    }

    /// Enumerate the top-level keys of the payload, iff not cleared.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.require_live()?;
        Ok(self
            .payload
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Whether `key` is present at the top level, iff not cleared.
    pub fn has(&self, key: &str) -> Result<bool> {
        self.require_live()?;
        Ok(self
            .payload
            .as_object()
            .map(|o| o.contains_key(key))
            .unwrap_or(false))
    }

    /// Fetch a single top-level field by path, iff not cleared.
    pub fn get(&self, key: &str) -> Result<Option<&Value>> {
        self.require_live()?;
        Ok(self.payload.as_object().and_then(|o| o.get(key)))
    }

    /// Deserialize the entire payload into `T`, iff not cleared.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        self.require_live()?;
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Validation(format!("payload does not match requested type: {e}")))
    }

    /// The raw JSON payload, iff not cleared.
    pub fn as_json(&self) -> Result<&Value> {
        self.require_live()?;
        Ok(&self.payload)
    }

    /// Wipe this view. All subsequent accessor calls return `Err(Locked)`.
    pub fn clear(&mut self) {
        self.payload = Value::Null;
        self.cleared = true;
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    fn require_live(&self) -> Result<()> {
        if self.cleared {
            return Err(Error::Locked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_enumerates_top_level_fields() {
        let view = SecureDataView::new(json!({"value1": 42, "nested": {"a": "b"}}));
        let mut keys = view.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["nested".to_string(), "value1".to_string()]);
    }

    #[test]
    fn has_and_get_reflect_payload() {
        let view = SecureDataView::new(json!({"a": 1}));
        assert!(view.has("a").unwrap());
        assert!(!view.has("b").unwrap());
        assert_eq!(view.get("a").unwrap(), Some(&json!(1)));
    }

    #[test]
    fn clear_makes_all_accessors_fail() {
        let mut view = SecureDataView::new(json!({"a": 1}));
        view.clear();
        assert!(matches!(view.keys(), Err(Error::Locked)));
        assert!(matches!(view.has("a"), Err(Error::Locked)));
        assert!(matches!(view.get("a"), Err(Error::Locked)));
        assert!(matches!(view.as_json(), Err(Error::Locked)));
    }

    #[test]
    fn value_deserializes_into_typed_struct() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            value1: i64,
        }
        let view = SecureDataView::new(json!({"value1": 42}));
        assert_eq!(view.value::<Payload>().unwrap(), Payload { value1: 42 });
    }
}
