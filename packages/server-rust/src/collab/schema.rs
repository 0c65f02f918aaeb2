//! Minimal schema validator: required top-level keys of a JSON object.

use busline_core::Payload;

use crate::traits::{SchemaFailure, SchemaValidator};

#[derive(Debug, Clone)]
pub struct RequiredKeysValidator {
    keys: Vec<String>,
    needs_details: bool,
}

impl RequiredKeysValidator {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            needs_details: false,
        }
    }

    /// Return the missing key names to the caller.
    #[must_use]
    pub fn with_details(mut self) -> Self {
        self.needs_details = true;
        self
    }
}

impl SchemaValidator for RequiredKeysValidator {
    fn is_initialized(&self) -> bool {
        !self.keys.is_empty()
    }

    fn validate(&self, cid: &str, payload: &Payload) -> Result<(), SchemaFailure> {
        let Some(object) = payload.as_json().and_then(|v| v.as_object()) else {
            return Err(SchemaFailure {
                short: "expected a JSON object".into(),
                details: "request body must be a JSON object".into(),
                needs_details: self.needs_details,
            });
        };
        let missing: Vec<&str> = self
            .keys
            .iter()
            .filter(|k| !object.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(cid = %cid, missing = ?missing, "schema validation failed");
        Err(SchemaFailure {
            short: "missing required keys".into(),
            details: format!("missing required keys: {}", missing.join(", ")),
            needs_details: self.needs_details,
        })
    }
}
