//! In-memory channel registry.
//!
//! Channels are matched by `{param}` path templates. The compiled table is an
//! immutable snapshot swapped in wholesale on every update, so readers never
//! block and never observe a half-applied change.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use busline_core::{ChannelDescriptor, ChannelParams, ParamValue};
use regex::Regex;

use crate::dispatch::request::normalize_accept;
use crate::service::error::ChannelRegistryError;
use crate::traits::{ChannelMatch, ChannelRegistry};

/// Matches every Accept header value.
const ANY_ACCEPT: &str = "anyHTTP_SEPany";

#[derive(Debug)]
struct Route {
    pattern: Regex,
    params: Vec<String>,
    accept_key: Option<String>,
    channel: Arc<ChannelDescriptor>,
}

impl Route {
    fn compile(channel: ChannelDescriptor) -> Result<Self, ChannelRegistryError> {
        let (pattern, params) = compile_template(&channel.match_target)?;
        Ok(Self {
            pattern,
            params,
            accept_key: channel
                .accept
                .as_deref()
                .map(|a| normalize_accept(Some(a))),
            channel: Arc::new(channel),
        })
    }

    fn accepts(&self, method: &str, accept_key: &str) -> bool {
        let method_ok = self
            .channel
            .method
            .as_deref()
            .is_none_or(|m| m.eq_ignore_ascii_case(method));
        let accept_ok = match &self.accept_key {
            None => true,
            Some(key) => key == ANY_ACCEPT || accept_key == ANY_ACCEPT || key == accept_key,
        };
        method_ok && accept_ok
    }
}

/// Turns `/orders/{id}/items` into an anchored regex with one named group
/// per parameter.
fn compile_template(template: &str) -> Result<(Regex, Vec<String>), ChannelRegistryError> {
    let invalid = |reason: &str| ChannelRegistryError::InvalidPattern {
        pattern: template.to_string(),
        reason: reason.to_string(),
    };

    let mut regex = String::from("^");
    let mut params = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        regex.push_str(&regex::escape(&rest[..open]));
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| invalid("unclosed `{`"))?;
        let name = &after[..close];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("parameter names are alphanumeric"));
        }
        if params.iter().any(|p| p == name) {
            return Err(invalid("duplicate parameter"));
        }
        regex.push_str(&format!("(?P<{name}>[^/]+)"));
        params.push(name.to_string());
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(invalid("unopened `}`"));
    }
    regex.push_str(&regex::escape(rest));
    regex.push('$');

    let compiled = Regex::new(&regex).map_err(|e| invalid(&e.to_string()))?;
    Ok((compiled, params))
}

/// Channel registry over an atomically replaced route snapshot. Routes are
/// tried in registration order; the first match wins.
#[derive(Debug)]
pub struct RouteTable {
    routes: ArcSwap<Vec<Route>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replaces every route. On error the previous table stays in place.
    ///
    /// # Errors
    ///
    /// Returns an error if a template does not compile or two channels share
    /// an id.
    pub fn replace(&self, channels: Vec<ChannelDescriptor>) -> Result<(), ChannelRegistryError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(channels.len());
        for channel in channels {
            if !seen.insert(channel.id) {
                return Err(ChannelRegistryError::DuplicateId { id: channel.id });
            }
            routes.push(Route::compile(channel)?);
        }
        tracing::info!(count = routes.len(), "channel routes replaced");
        self.routes.store(Arc::new(routes));
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.load().is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry for RouteTable {
    fn match_request(&self, path: &str, method: &str, accept_key: &str) -> Option<ChannelMatch> {
        let routes = self.routes.load();
        routes.iter().find_map(|route| {
            if !route.accepts(method, accept_key) {
                return None;
            }
            let caps = route.pattern.captures(path)?;
            let path_params: ChannelParams = route
                .params
                .iter()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.clone(), ParamValue::Single(m.as_str().to_string())))
                })
                .collect();
            Some(ChannelMatch {
                path_params,
                channel: route.channel.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(channels: Vec<ChannelDescriptor>) -> RouteTable {
        let t = RouteTable::new();
        t.replace(channels).unwrap();
        t
    }

    #[test]
    fn extracts_path_params() {
        let t = table(vec![ChannelDescriptor::new(1, "items", "/orders/{order}/items/{item}", "s")]);
        let m = t.match_request("/orders/7/items/x-1", "GET", ANY_ACCEPT).unwrap();
        assert_eq!(m.channel.id, 1);
        assert_eq!(m.path_params["order"], ParamValue::from("7"));
        assert_eq!(m.path_params["item"], ParamValue::from("x-1"));
        assert!(t.match_request("/orders/7/items", "GET", ANY_ACCEPT).is_none());
        assert!(t.match_request("/orders/7/items/x/y", "GET", ANY_ACCEPT).is_none());
    }

    #[test]
    fn literal_segments_are_escaped() {
        let t = table(vec![ChannelDescriptor::new(1, "dot", "/v1.0/ping", "s")]);
        assert!(t.match_request("/v1.0/ping", "GET", ANY_ACCEPT).is_some());
        assert!(t.match_request("/v1x0/ping", "GET", ANY_ACCEPT).is_none());
    }

    #[test]
    fn method_and_accept_filter() {
        let mut get_json = ChannelDescriptor::new(1, "get-json", "/r", "s");
        get_json.method = Some("GET".into());
        get_json.accept = Some("application/json".into());
        let mut post_any = ChannelDescriptor::new(2, "post", "/r", "s");
        post_any.method = Some("POST".into());
        let t = table(vec![get_json, post_any]);

        let json_key = normalize_accept(Some("application/json"));
        let xml_key = normalize_accept(Some("text/xml"));
        assert_eq!(t.match_request("/r", "get", &json_key).unwrap().channel.id, 1);
        assert_eq!(t.match_request("/r", "GET", ANY_ACCEPT).unwrap().channel.id, 1);
        assert!(t.match_request("/r", "GET", &xml_key).is_none());
        assert_eq!(t.match_request("/r", "POST", &xml_key).unwrap().channel.id, 2);
        assert!(t.match_request("/r", "DELETE", ANY_ACCEPT).is_none());
    }

    #[test]
    fn first_registered_route_wins() {
        let t = table(vec![
            ChannelDescriptor::new(1, "specific", "/users/me", "s"),
            ChannelDescriptor::new(2, "generic", "/users/{id}", "s"),
        ]);
        assert_eq!(t.match_request("/users/me", "GET", ANY_ACCEPT).unwrap().channel.id, 1);
        assert_eq!(t.match_request("/users/42", "GET", ANY_ACCEPT).unwrap().channel.id, 2);
    }

    #[test]
    fn bad_templates_keep_previous_table() {
        let t = table(vec![ChannelDescriptor::new(1, "ok", "/ok", "s")]);
        for bad in ["/x/{", "/x/{}", "/x/{a-b}", "/x/}", "/x/{a}/{a}"] {
            let err = t
                .replace(vec![ChannelDescriptor::new(2, "bad", bad, "s")])
                .unwrap_err();
            assert!(matches!(err, ChannelRegistryError::InvalidPattern { .. }), "{bad}");
        }
        assert_eq!(t.len(), 1);
        assert!(t.match_request("/ok", "GET", ANY_ACCEPT).is_some());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let t = RouteTable::new();
        let err = t
            .replace(vec![
                ChannelDescriptor::new(1, "a", "/a", "s"),
                ChannelDescriptor::new(1, "b", "/b", "s"),
            ])
            .unwrap_err();
        assert_eq!(err, ChannelRegistryError::DuplicateId { id: 1 });
        assert!(t.is_empty());
    }
}
