// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_utils::error::JsError;

/// Normalizes a module entry filename to an absolute in-sandbox path.
///
/// - missing or empty input resolves to `/index.js`
/// - bare names gain a leading `/`
/// - `./…` resolves as absolute from the root
/// - paths ending in `/` gain `index.js`
/// - `.` and `..` segments collapse; escaping the root is an error
pub fn normalize_entry_filename(input: Option<&str>) -> Result<String, JsError> {
    let raw = match input {
        None | Some("") => return Ok("/index.js".to_string()),
        Some(raw) => raw,
    };

    let mut path = raw.to_string();
    if let Some(rest) = path.strip_prefix("./") {
        path = ["/", rest].concat();
    }
    if !path.starts_with('/') {
        path = ["/", &path].concat();
    }
    if path.ends_with('/') {
        path.push_str("index.js");
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                if segments.pop().is_none() {
                    return Err(JsError::error(format!(
                        "Entry filename '{raw}' resolves outside the sandbox root"
                    )));
                }
            },
            segment => segments.push(segment),
        }
    }

    Ok(["/", &segments.join("/")].concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inputs_default_to_index() {
        assert_eq!(normalize_entry_filename(None).unwrap(), "/index.js");
        assert_eq!(normalize_entry_filename(Some("")).unwrap(), "/index.js");
    }

    #[test]
    fn bare_names_are_rooted() {
        assert_eq!(normalize_entry_filename(Some("main.js")).unwrap(), "/main.js");
    }

    #[test]
    fn relative_prefix_resolves_from_root() {
        assert_eq!(
            normalize_entry_filename(Some("./foo/bar/../baz.js")).unwrap(),
            "/foo/baz.js"
        );
    }

    #[test]
    fn absolute_paths_are_left_alone() {
        assert_eq!(
            normalize_entry_filename(Some("/a/b/c.js")).unwrap(),
            "/a/b/c.js"
        );
    }

    #[test]
    fn trailing_slash_appends_index() {
        assert_eq!(normalize_entry_filename(Some("/lib/")).unwrap(), "/lib/index.js");
        assert_eq!(normalize_entry_filename(Some("lib/")).unwrap(), "/lib/index.js");
    }

    #[test]
    fn dot_segments_collapse() {
        assert_eq!(
            normalize_entry_filename(Some("/a/./b/../c.js")).unwrap(),
            "/a/c.js"
        );
    }

    #[test]
    fn escaping_the_root_fails() {
        assert!(normalize_entry_filename(Some("../x")).is_err());
        assert!(normalize_entry_filename(Some("/a/../../x.js")).is_err());
        assert!(normalize_entry_filename(Some("./../x.js")).is_err());
    }
}
