//! Transport-neutral request and response envelopes for the dispatcher.

use std::collections::BTreeMap;
use std::time::SystemTime;

use bytes::Bytes;
use http::StatusCode;

/// Already-decoded request metadata handed over by a transport adapter.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query_string: String,
    pub accept: Option<String>,
    /// Header names are lower-case.
    pub headers: BTreeMap<String, String>,
    pub remote_addr: Option<String>,
}

impl RequestMeta {
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query_string = query.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        if name == "accept" {
            self.accept = Some(value.clone());
        }
        self.headers.insert(name, value);
        self
    }

    /// Header lookup by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// One inbound request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub cid: String,
    pub timestamp: SystemTime,
    pub meta: RequestMeta,
    /// Body, read once by the transport and shared by every stage.
    pub body: Bytes,
}

impl DispatchRequest {
    /// A request with a fresh cid, stamped now.
    #[must_use]
    pub fn new(meta: RequestMeta, body: impl Into<Bytes>) -> Self {
        Self {
            cid: busline_core::new_cid(),
            timestamp: SystemTime::now(),
            meta,
            body: body.into(),
        }
    }
}

/// One outbound response.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub cid: String,
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl DispatchResponse {
    /// `"404 Not Found"` style status line.
    #[must_use]
    pub fn status_line(&self) -> String {
        format!(
            "{} {}",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Unknown")
        )
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }
}

/// Normalizes an Accept header into a registry lookup key.
///
/// A missing header means `*/*`. `*` becomes `any` and `/` becomes
/// `HTTP_SEP`, so `*/*` is `anyHTTP_SEPany`.
#[must_use]
pub fn normalize_accept(accept: Option<&str>) -> String {
    let accept = accept.map(str::trim).filter(|a| !a.is_empty()).unwrap_or("*/*");
    accept.replace('*', "any").replace('/', "HTTP_SEP")
}
