//! Channel and security descriptors shared by the dispatcher and the engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a request reached a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    HttpSoap,
    Invoke,
    InvokeAsync,
    AsyncCallback,
    Scheduler,
    Service,
    WebSocket,
    PubSub,
    FanoutCall,
    ParallelExecCall,
    NewInstance,
}

impl ChannelType {
    /// Channels on which per-verb handlers are honoured.
    #[must_use]
    pub fn is_http_like(self) -> bool {
        matches!(self, Self::HttpSoap | Self::Invoke)
    }

    /// Channels whose completion must be reported to the pattern registry.
    #[must_use]
    pub fn is_pattern_call(self) -> bool {
        matches!(self, Self::FanoutCall | Self::ParallelExecCall)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HttpSoap => "http-soap",
            Self::Invoke => "invoke",
            Self::InvokeAsync => "invoke-async",
            Self::AsyncCallback => "async-callback",
            Self::Scheduler => "scheduler",
            Self::Service => "service",
            Self::WebSocket => "web-socket",
            Self::PubSub => "pubsub",
            Self::FanoutCall => "fanout-call",
            Self::ParallelExecCall => "parallel-exec-call",
            Self::NewInstance => "new-instance",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared payload format of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Dict,
    Xml,
    Hl7,
    Plain,
}

impl DataFormat {
    /// JSON and dict payloads share the structured-value representation.
    #[must_use]
    pub fn is_json_like(self) -> bool {
        matches!(self, Self::Json | Self::Dict)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    #[default]
    PlainHttp,
    Soap,
}

/// Which side wins when a path parameter and a query parameter share a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamsPriority {
    #[default]
    QueryOverPath,
    PathOverQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Builtin,
}

/// Response caching attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_type: CacheType,
    pub name: String,
    /// Entry lifetime; `None` keeps entries until evicted.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityType {
    Basic,
    ApiKey,
    Jwt,
    OAuth,
}

impl SecurityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic_auth",
            Self::ApiKey => "apikey",
            Self::Jwt => "jwt",
            Self::OAuth => "oauth",
        }
    }
}

/// Security definition attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDescriptor {
    pub id: u64,
    pub name: String,
    pub sec_type: SecurityType,
    /// Expected user name (basic auth) or header name (API key).
    pub username: Option<String>,
    /// Identity to link the authenticated caller to, if any.
    pub linked_identity: Option<String>,
}

/// Successful outcome of a security check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub security_id: u64,
    pub security_type: SecurityType,
    pub username: Option<String>,
    /// Token as presented by the caller, kept for identity linking.
    pub raw_token: Option<String>,
}

/// Security facts a running service may inspect.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub security_id: Option<u64>,
    pub security_name: Option<String>,
    pub security_type: Option<SecurityType>,
    pub username: Option<String>,
}

impl SecurityInfo {
    #[must_use]
    pub fn from_auth(descriptor: &SecurityDescriptor, auth: &AuthResult) -> Self {
        Self {
            security_id: Some(auth.security_id),
            security_name: Some(descriptor.name.clone()),
            security_type: Some(auth.security_type),
            username: auth.username.clone(),
        }
    }

    /// Flattens the info into string pairs, omitting unset fields.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(id) = self.security_id {
            out.insert("security_id".to_string(), id.to_string());
        }
        if let Some(name) = &self.security_name {
            out.insert("security_name".to_string(), name.clone());
        }
        if let Some(kind) = self.security_type {
            out.insert("security_type".to_string(), kind.as_str().to_string());
        }
        if let Some(user) = &self.username {
            out.insert("username".to_string(), user.clone());
        }
        out
    }
}

/// Inbound channel definition. Route matching returns one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: u64,
    pub name: String,
    pub is_active: bool,
    /// URL pattern, e.g. `/orders/{id}`.
    pub match_target: String,
    /// Restricts the channel to one HTTP method; `None` accepts any.
    pub method: Option<String>,
    /// Restricts the channel to one Accept value; `None` accepts any.
    pub accept: Option<String>,
    /// Target service name.
    pub service: String,
    pub data_format: Option<DataFormat>,
    pub transport: Transport,
    pub security: Option<SecurityDescriptor>,
    pub cache: Option<CacheConfig>,
    pub merge_url_params: bool,
    pub params_priority: ParamsPriority,
    pub content_encoding: Option<ContentEncoding>,
    pub rate_limit_active: bool,
    pub audit_received: bool,
    pub audit_sent: bool,
}

impl ChannelDescriptor {
    /// An active plain-HTTP channel with every optional feature off.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>, match_target: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: true,
            match_target: match_target.into(),
            method: None,
            accept: None,
            service: service.into(),
            data_format: None,
            transport: Transport::PlainHttp,
            security: None,
            cache: None,
            merge_url_params: false,
            params_priority: ParamsPriority::default(),
            content_encoding: None,
            rate_limit_active: false,
            audit_received: false,
            audit_sent: false,
        }
    }
}

/// What a running service knows about the channel it was invoked through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: Option<u64>,
    pub name: String,
    pub channel_type: ChannelType,
    pub data_format: Option<DataFormat>,
    pub is_internal: bool,
    pub match_target: Option<String>,
    pub security: Arc<SecurityInfo>,
}

impl ChannelInfo {
    /// Channel info for an internal (non-HTTP) invocation.
    #[must_use]
    pub fn internal(channel_type: ChannelType, data_format: Option<DataFormat>) -> Self {
        Self {
            id: None,
            name: channel_type.as_str().to_string(),
            channel_type,
            data_format,
            is_internal: true,
            match_target: None,
            security: Arc::new(SecurityInfo::default()),
        }
    }

    /// Channel info for a request matched to an HTTP channel.
    #[must_use]
    pub fn from_descriptor(descriptor: &ChannelDescriptor, security: SecurityInfo) -> Self {
        Self {
            id: Some(descriptor.id),
            name: descriptor.name.clone(),
            channel_type: ChannelType::HttpSoap,
            data_format: descriptor.data_format,
            is_internal: false,
            match_target: Some(descriptor.match_target.clone()),
            security: Arc::new(security),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_like_channels() {
        assert!(ChannelType::HttpSoap.is_http_like());
        assert!(ChannelType::Invoke.is_http_like());
        assert!(!ChannelType::InvokeAsync.is_http_like());
        assert!(!ChannelType::Scheduler.is_http_like());
    }

    #[test]
    fn pattern_channels() {
        assert!(ChannelType::FanoutCall.is_pattern_call());
        assert!(ChannelType::ParallelExecCall.is_pattern_call());
        assert!(!ChannelType::Invoke.is_pattern_call());
    }

    #[test]
    fn json_like_formats() {
        assert!(DataFormat::Json.is_json_like());
        assert!(DataFormat::Dict.is_json_like());
        assert!(!DataFormat::Xml.is_json_like());
    }

    #[test]
    fn security_info_map_skips_unset_fields() {
        let info = SecurityInfo {
            security_id: Some(7),
            username: Some("alice".into()),
            ..SecurityInfo::default()
        };
        let map = info.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["security_id"], "7");
        assert_eq!(map["username"], "alice");
    }

    #[test]
    fn descriptor_defaults() {
        let d = ChannelDescriptor::new(1, "orders", "/orders/{id}", "orders.get");
        assert!(d.is_active);
        assert!(d.security.is_none());
        assert_eq!(d.params_priority, ParamsPriority::QueryOverPath);
        let info = ChannelInfo::from_descriptor(&d, SecurityInfo::default());
        assert_eq!(info.channel_type, ChannelType::HttpSoap);
        assert!(!info.is_internal);
    }
}
