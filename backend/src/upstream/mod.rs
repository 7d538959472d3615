// Upstream Client - authenticated transport to the ServiceNow REST API

mod breaker;
mod client;
mod query;
mod rate_limit;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{parse_sn_datetime, ServiceNowClient};
pub use query::{EncodedQuery, QueryOp};
pub use rate_limit::LeakyBucket;

use crate::error::CoreResult;
use async_trait::async_trait;
use serde_json::Value;
use snowbridge_shared::{JournalElement, JournalEntry};

/// A request credential as attached to the wire. Issuance is handled by an
/// external auth flow; the core only holds and refreshes the result.
#[derive(Debug, Clone)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Source of upstream credentials. Implementations must tolerate external
/// rotation: `refresh` is called once after a 401 and should return the
/// currently valid credential, whatever produced it.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> CoreResult<Credential>;
    async fn refresh(&self) -> CoreResult<Credential>;
}

/// Fixed username/password provider. Rotation happens by swapping the
/// provider behind the trait; refresh simply re-reads the stored pair.
pub struct StaticCredentials {
    inner: std::sync::RwLock<Credential>,
}

impl StaticCredentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            inner: std::sync::RwLock::new(Credential::Basic {
                username: username.into(),
                password: password.into(),
            }),
        }
    }

    pub fn set(&self, credential: Credential) {
        *self.inner.write().expect("credential lock poisoned") = credential;
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self) -> CoreResult<Credential> {
        Ok(self.inner.read().expect("credential lock poisoned").clone())
    }

    async fn refresh(&self) -> CoreResult<Credential> {
        self.credential().await
    }
}

/// Operations the rest of the core uses against the upstream. The seam for
/// dependency injection; the production implementation is [`ServiceNowClient`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceNowApi: Send + Sync {
    async fn query(
        &self,
        table: &str,
        encoded_query: &str,
        limit: u32,
        offset: u32,
    ) -> CoreResult<Vec<Value>>;

    async fn get_record(&self, table: &str, sys_id: &str) -> CoreResult<Option<Value>>;

    async fn create_record(&self, table: &str, body: &Value) -> CoreResult<Value>;

    async fn update_record(&self, table: &str, sys_id: &str, changes: &Value)
        -> CoreResult<Value>;

    async fn delete_record(&self, table: &str, sys_id: &str) -> CoreResult<bool>;

    async fn fetch_journal(
        &self,
        element_id: &str,
        element: JournalElement,
    ) -> CoreResult<Vec<JournalEntry>>;

    async fn upload_attachment(
        &self,
        table: &str,
        sys_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> CoreResult<Value>;

    async fn download_attachment(&self, attachment_sys_id: &str) -> CoreResult<Option<Vec<u8>>>;
}

/// Collapse an upstream field to its preferred string form.
///
/// Reference fields arrive as `{display_value, value, link?}` objects when
/// display values are requested; plain fields arrive as scalars. The dual
/// shape never leaks past this layer: prefer `display_value`, fall back to
/// `value`, and use the raw scalar otherwise.
pub fn display_string(field: &Value) -> Option<String> {
    match field {
        Value::Object(map) => {
            for key in ["display_value", "value"] {
                match map.get(key) {
                    Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                    Some(Value::Number(n)) => return Some(n.to_string()),
                    Some(Value::Bool(b)) => return Some(b.to_string()),
                    _ => {}
                }
            }
            None
        }
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Like [`display_string`] but prefers the raw `value` side, for fields
/// that must keep their machine encoding (states, sys_ids).
pub fn raw_string(field: &Value) -> Option<String> {
    match field {
        Value::Object(map) => match map.get("value") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_display_string_prefers_display_value() {
        let field = json!({"display_value": "Network Ops", "value": "abc123", "link": "https://x"});
        assert_eq!(display_string(&field), Some("Network Ops".to_string()));
    }

    #[test]
    fn test_display_string_falls_back_to_value() {
        let field = json!({"display_value": "", "value": "abc123"});
        assert_eq!(display_string(&field), Some("abc123".to_string()));
    }

    #[test]
    fn test_display_string_scalar_passthrough() {
        assert_eq!(display_string(&json!("plain")), Some("plain".to_string()));
        assert_eq!(display_string(&json!(3)), Some("3".to_string()));
        assert_eq!(display_string(&json!("")), None);
        assert_eq!(display_string(&json!(null)), None);
    }

    #[test]
    fn test_raw_string_prefers_value() {
        let field = json!({"display_value": "2 - High", "value": "2"});
        assert_eq!(raw_string(&field), Some("2".to_string()));
        assert_eq!(raw_string(&json!("6")), Some("6".to_string()));
    }
}
