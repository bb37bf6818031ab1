// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use islet_bridge::HostValue;
use islet_exceptions::DOMException;
use islet_utils::error::JsError;

/// Deep copy with structured-clone semantics: data shapes clone, identity
/// shapes (functions, promises, streams, handles) fail with a
/// `DataCloneError`.
pub fn structured_clone(value: &HostValue) -> Result<HostValue, JsError> {
    clone_value(value, 0)
}

fn clone_value(value: &HostValue, depth: usize) -> Result<HostValue, JsError> {
    if depth > 100 {
        return Err(JsError::range_error("Maximum clone depth exceeded"));
    }
    Ok(match value {
        HostValue::Undefined
        | HostValue::Null
        | HostValue::Bool(_)
        | HostValue::Int(_)
        | HostValue::Float(_)
        | HostValue::String(_)
        | HostValue::BigInt(_)
        | HostValue::Bytes(_)
        | HostValue::Date { .. }
        | HostValue::RegExp { .. }
        | HostValue::Url(_)
        | HostValue::Headers(_)
        | HostValue::Blob { .. }
        | HostValue::File { .. }
        | HostValue::FormData(_) => value.clone(),
        HostValue::Array(items) => {
            let snapshot = items.lock().unwrap().clone();
            HostValue::array(
                snapshot
                    .iter()
                    .map(|item| clone_value(item, depth + 1))
                    .collect::<Result<Vec<_>, JsError>>()?,
            )
        },
        HostValue::Object(entries) => {
            let snapshot = entries.lock().unwrap().clone();
            HostValue::object(
                snapshot
                    .iter()
                    .map(|(key, entry)| Ok((key.clone(), clone_value(entry, depth + 1)?)))
                    .collect::<Result<Vec<_>, JsError>>()?,
            )
        },
        other => {
            return Err(
                DOMException::data_clone_error(format!("{} could not be cloned", other.kind_name()))
                    .into(),
            );
        },
    })
}

#[cfg(test)]
mod tests {
    use islet_bridge::HostFunction;

    use super::*;

    #[test]
    fn clones_data_shapes_deeply() {
        let original = HostValue::object(vec![(
            "inner".to_string(),
            HostValue::array(vec![HostValue::Int(1), HostValue::string("x")]),
        )]);
        let clone = structured_clone(&original).unwrap();
        assert_eq!(clone, original);

        // Mutating the clone leaves the original untouched.
        if let HostValue::Object(entries) = &clone {
            entries
                .lock()
                .unwrap()
                .push(("extra".to_string(), HostValue::Null));
        }
        if let HostValue::Object(entries) = &original {
            assert_eq!(entries.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn functions_fail_with_data_clone_error() {
        let function = HostValue::Function(HostFunction::from_sync(|_| Ok(HostValue::Null)));
        let err = structured_clone(&function).unwrap_err();
        assert_eq!(err.name(), "DataCloneError");
    }
}
