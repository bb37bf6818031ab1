// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use url::Url;

/// Represents `URLSearchParams` in the guest context.
///
/// <https://developer.mozilla.org/en-US/docs/Web/API/URLSearchParams>
///
/// URLSearchParams operates directly on a shared `Url` instead of keeping
/// derived state that can drift. Used standalone it still needs a valid URL
/// underneath (http://example.com), which never leaks out: callers only see
/// the query string.
#[derive(Clone)]
pub struct URLSearchParams {
    pub(crate) url: Arc<Mutex<Url>>,
}

impl URLSearchParams {
    pub fn new() -> Self {
        Self::from_shared(Arc::new(Mutex::new(dummy_url())))
    }

    /// Parses `"a=1&b=2"` style input; a single leading `?` is ignored.
    pub fn from_str(init: &str) -> Self {
        let init = init.strip_prefix('?').unwrap_or(init);
        let mut url = dummy_url();
        if init.is_empty() {
            url.set_query(None);
        } else {
            // Round-trip through the form parser so percent-escapes and '+'
            // normalize the same way the guest constructor does.
            let pairs: Vec<(String, String)> = url::form_urlencoded::parse(init.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        Self::from_shared(Arc::new(Mutex::new(url)))
    }

    pub fn from_pairs<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Self {
        let mut url = dummy_url();
        url.query_pairs_mut().clear().extend_pairs(
            pairs
                .iter()
                .map(|(key, value)| (key.as_ref(), value.as_ref())),
        );
        if pairs.is_empty() {
            url.set_query(None);
        }
        Self::from_shared(Arc::new(Mutex::new(url)))
    }

    pub(crate) fn from_shared(url: Arc<Mutex<Url>>) -> Self {
        Self { url }
    }

    pub fn size(&self) -> usize {
        self.url.lock().unwrap().query_pairs().count()
    }

    pub fn append(&self, key: &str, value: &str) {
        self.url
            .lock()
            .unwrap()
            .query_pairs_mut()
            .append_pair(key, value);
    }

    pub fn delete(&self, key: &str, value: Option<&str>) {
        self.mutate(|pairs| {
            pairs.retain(|(existing_key, existing_value)| match value {
                Some(value) => !(existing_key == key && existing_value == value),
                None => existing_key != key,
            });
        });
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.url
            .lock()
            .unwrap()
            .query_pairs()
            .find(|(existing_key, _)| existing_key == key)
            .map(|(_, value)| value.into_owned())
    }

    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.url
            .lock()
            .unwrap()
            .query_pairs()
            .filter(|(existing_key, _)| existing_key == key)
            .map(|(_, value)| value.into_owned())
            .collect()
    }

    pub fn has(&self, key: &str, value: Option<&str>) -> bool {
        self.url
            .lock()
            .unwrap()
            .query_pairs()
            .any(|(existing_key, existing_value)| {
                existing_key == key && value.map_or(true, |value| existing_value == value)
            })
    }

    /// Replaces every entry for `key` with a single pair, appending when
    /// absent.
    pub fn set(&self, key: &str, value: &str) {
        self.mutate(|pairs| {
            let mut replaced = false;
            pairs.retain_mut(|(existing_key, existing_value)| {
                if existing_key != key {
                    return true;
                }
                if replaced {
                    return false;
                }
                replaced = true;
                *existing_value = value.to_string();
                true
            });
            if !replaced {
                pairs.push((key.to_string(), value.to_string()));
            }
        });
    }

    /// Stable sort by key; relative order of equal keys is preserved.
    pub fn sort(&self) {
        self.mutate(|pairs| pairs.sort_by(|(a, _), (b, _)| a.cmp(b)));
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.url
            .lock()
            .unwrap()
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|(key, _)| key).collect()
    }

    pub fn values(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    pub fn for_each(&self, mut callback: impl FnMut(&str, &str)) {
        for (key, value) in self.entries() {
            callback(&value, &key);
        }
    }

    fn mutate(&self, mutate: impl FnOnce(&mut Vec<(String, String)>)) {
        let mut url = self.url.lock().unwrap();
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        mutate(&mut pairs);
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }
}

impl Default for URLSearchParams {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for URLSearchParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.lock().unwrap().query().unwrap_or_default())
    }
}

fn dummy_url() -> Url {
    Url::parse("http://example.com").expect("static url parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_strings() {
        let params = URLSearchParams::from_str("?a=1&b=2&a=3");
        assert_eq!(params.size(), 3);
        assert_eq!(params.get("a").as_deref(), Some("1"));
        assert_eq!(params.get_all("a"), vec!["1", "3"]);
        assert_eq!(params.get("b").as_deref(), Some("2"));
        assert_eq!(params.get("missing"), None);
    }

    #[test]
    fn append_set_delete() {
        let params = URLSearchParams::new();
        params.append("k", "v1");
        params.append("k", "v2");
        params.append("other", "x");
        assert_eq!(params.get_all("k"), vec!["v1", "v2"]);

        params.set("k", "only");
        assert_eq!(params.get_all("k"), vec!["only"]);

        params.delete("k", None);
        assert!(!params.has("k", None));
        assert!(params.has("other", Some("x")));
        assert!(!params.has("other", Some("y")));
    }

    #[test]
    fn value_scoped_delete() {
        let params = URLSearchParams::from_str("a=1&a=2&a=3");
        params.delete("a", Some("2"));
        assert_eq!(params.get_all("a"), vec!["1", "3"]);
    }

    #[test]
    fn sort_is_stable_by_key() {
        let params = URLSearchParams::from_str("c=1&a=first&b=x&a=second");
        params.sort();
        assert_eq!(
            params.entries(),
            vec![
                ("a".to_string(), "first".to_string()),
                ("a".to_string(), "second".to_string()),
                ("b".to_string(), "x".to_string()),
                ("c".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn stringifies_as_query() {
        let params = URLSearchParams::from_pairs(&[("a", "1"), ("b", "two words")]);
        assert_eq!(params.to_string(), "a=1&b=two+words");

        let empty = URLSearchParams::new();
        assert_eq!(empty.to_string(), "");
    }

    #[test]
    fn plus_decodes_as_space() {
        let params = URLSearchParams::from_str("q=two+words");
        assert_eq!(params.get("q").as_deref(), Some("two words"));
    }
}
