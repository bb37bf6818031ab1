// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use islet_utils::error::JsError;
use url::Url;

use crate::URLSearchParams;

/// Represents `URL` in the guest context, on top of the `url` crate's
/// parser.
///
/// <https://developer.mozilla.org/en-US/docs/Web/API/URL>
///
/// URL and URLSearchParams share ownership of the underlying `Url`, so
/// writing `search` through either is immediately visible to the other.
#[derive(Clone)]
pub struct URL {
    pub(crate) url: Arc<Mutex<Url>>,
}

impl URL {
    /// `new URL(input, base?)`. A relative `input` resolves against `base`;
    /// failures are `TypeError`s like in the guest.
    pub fn new(input: &str, base: Option<&str>) -> Result<Self, JsError> {
        let url = match base {
            Some(base) => {
                let base = Url::parse(base)
                    .map_err(|_| JsError::type_error(["Invalid base URL: ", base].concat()))?;
                base.join(input)
                    .map_err(|_| JsError::type_error(["Invalid URL: ", input].concat()))?
            },
            None => Url::parse(input)
                .map_err(|_| JsError::type_error(["Invalid URL: ", input].concat()))?,
        };
        Ok(Self {
            url: Arc::new(Mutex::new(url)),
        })
    }

    /// `URL.canParse(input, base?)`.
    pub fn can_parse(input: &str, base: Option<&str>) -> bool {
        Self::new(input, base).is_ok()
    }

    pub fn href(&self) -> String {
        self.url.lock().unwrap().as_str().to_string()
    }

    pub fn set_href(&self, value: &str) -> Result<(), JsError> {
        let parsed =
            Url::parse(value).map_err(|_| JsError::type_error(["Invalid URL: ", value].concat()))?;
        *self.url.lock().unwrap() = parsed;
        Ok(())
    }

    pub fn origin(&self) -> String {
        self.url.lock().unwrap().origin().ascii_serialization()
    }

    pub fn protocol(&self) -> String {
        let url = self.url.lock().unwrap();
        [url.scheme(), ":"].concat()
    }

    pub fn set_protocol(&self, value: &str) {
        let scheme = value.strip_suffix(':').unwrap_or(value);
        // Scheme changes the parser refuses (e.g. special to non-special)
        // are ignored, like the guest setter.
        let _ = self.url.lock().unwrap().set_scheme(&scheme.to_ascii_lowercase());
    }

    pub fn username(&self) -> String {
        self.url.lock().unwrap().username().to_string()
    }

    pub fn set_username(&self, value: &str) {
        let _ = self.url.lock().unwrap().set_username(value);
    }

    pub fn password(&self) -> String {
        self.url
            .lock()
            .unwrap()
            .password()
            .unwrap_or_default()
            .to_string()
    }

    pub fn set_password(&self, value: &str) {
        let password = if value.is_empty() { None } else { Some(value) };
        let _ = self.url.lock().unwrap().set_password(password);
    }

    /// Host including the port when present; IPv6 hosts keep their
    /// brackets.
    pub fn host(&self) -> String {
        let url = self.url.lock().unwrap();
        let host = url.host_str().unwrap_or_default();
        match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    pub fn set_host(&self, value: &str) {
        let mut url = self.url.lock().unwrap();
        let (host, port) = match value.rsplit_once(':') {
            // Only treat the suffix as a port when it parses; "[::1]" also
            // contains colons.
            Some((host, port)) if !host.ends_with(']') || value.starts_with('[') => {
                match port.parse::<u16>() {
                    Ok(port) => (host, Some(port)),
                    Err(_) => (value, None),
                }
            },
            _ => (value, None),
        };
        if url.set_host(Some(host)).is_ok() {
            if let Some(port) = port {
                let _ = url.set_port(Some(port));
            }
        }
    }

    pub fn hostname(&self) -> String {
        self.url
            .lock()
            .unwrap()
            .host_str()
            .unwrap_or_default()
            .to_string()
    }

    pub fn set_hostname(&self, value: &str) {
        let _ = self.url.lock().unwrap().set_host(Some(value));
    }

    pub fn port(&self) -> String {
        self.url
            .lock()
            .unwrap()
            .port()
            .map(|port| port.to_string())
            .unwrap_or_default()
    }

    pub fn set_port(&self, value: &str) {
        let mut url = self.url.lock().unwrap();
        if value.is_empty() {
            let _ = url.set_port(None);
        } else if let Ok(port) = value.parse::<u16>() {
            let _ = url.set_port(Some(port));
        }
    }

    pub fn pathname(&self) -> String {
        self.url.lock().unwrap().path().to_string()
    }

    pub fn set_pathname(&self, value: &str) {
        self.url.lock().unwrap().set_path(value);
    }

    pub fn search(&self) -> String {
        let url = self.url.lock().unwrap();
        match url.query() {
            Some(query) if !query.is_empty() => ["?", query].concat(),
            _ => String::new(),
        }
    }

    pub fn set_search(&self, value: &str) {
        let query = value.strip_prefix('?').unwrap_or(value);
        let mut url = self.url.lock().unwrap();
        if query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(query));
        }
    }

    /// Live view over the query string, sharing this URL's storage.
    pub fn search_params(&self) -> URLSearchParams {
        URLSearchParams::from_shared(self.url.clone())
    }

    pub fn hash(&self) -> String {
        let url = self.url.lock().unwrap();
        match url.fragment() {
            Some(fragment) if !fragment.is_empty() => ["#", fragment].concat(),
            _ => String::new(),
        }
    }

    pub fn set_hash(&self, value: &str) {
        let fragment = value.strip_prefix('#').unwrap_or(value);
        let mut url = self.url.lock().unwrap();
        if fragment.is_empty() {
            url.set_fragment(None);
        } else {
            url.set_fragment(Some(fragment));
        }
    }

    pub fn to_json(&self) -> String {
        self.href()
    }
}

impl std::fmt::Display for URL {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.href())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_urls() {
        let url = URL::new("https://user:pw@example.com:8443/a/b?q=1#frag", None).unwrap();
        assert_eq!(url.protocol(), "https:");
        assert_eq!(url.username(), "user");
        assert_eq!(url.password(), "pw");
        assert_eq!(url.hostname(), "example.com");
        assert_eq!(url.port(), "8443");
        assert_eq!(url.host(), "example.com:8443");
        assert_eq!(url.pathname(), "/a/b");
        assert_eq!(url.search(), "?q=1");
        assert_eq!(url.hash(), "#frag");
        assert_eq!(url.origin(), "https://example.com:8443");
    }

    #[test]
    fn resolves_relative_against_base() {
        let url = URL::new("/path", Some("https://example.com")).unwrap();
        assert_eq!(url.href(), "https://example.com/path");

        let url = URL::new("../sibling", Some("https://example.com/a/b/c")).unwrap();
        assert_eq!(url.href(), "https://example.com/a/sibling");
    }

    #[test]
    fn can_parse_reports_validity() {
        assert!(URL::can_parse("https://example.com", None));
        assert!(!URL::can_parse("not a url", None));
        assert!(URL::can_parse("/path", Some("https://example.com")));
        assert!(!URL::can_parse("/path", None));
    }

    #[test]
    fn ipv6_hosts_keep_brackets() {
        let url = URL::new("http://[::1]:8080/x", None).unwrap();
        assert_eq!(url.hostname(), "[::1]");
        assert_eq!(url.host(), "[::1]:8080");
    }

    #[test]
    fn setters_update_href() {
        let url = URL::new("http://example.com/a?x=1#h", None).unwrap();
        url.set_protocol("https");
        url.set_pathname("/b");
        url.set_search("?y=2");
        url.set_hash("#new");
        assert_eq!(url.href(), "https://example.com/b?y=2#new");

        url.set_search("");
        url.set_hash("");
        assert_eq!(url.href(), "https://example.com/b");
    }

    #[test]
    fn invalid_input_is_a_type_error() {
        let err = URL::new("::nope::", None).unwrap_err();
        assert_eq!(err.name(), "TypeError");
        let err = URL::new("/x", Some("also bad")).unwrap_err();
        assert!(err.message.contains("Invalid base URL"));
    }

    #[test]
    fn search_params_share_the_underlying_url() {
        let url = URL::new("http://example.com/?a=1", None).unwrap();
        let params = url.search_params();
        assert_eq!(params.get("a").as_deref(), Some("1"));

        // Writing search invalidates previous params views.
        url.set_search("?b=2");
        assert_eq!(params.get("a"), None);
        assert_eq!(params.get("b").as_deref(), Some("2"));

        // And the other direction: params writes show up on the URL.
        params.set("c", "3");
        assert!(url.search().contains("b=2"));
        assert!(url.search().contains("c=3"));
    }
}
