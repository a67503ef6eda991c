//! Structural validation of inbound frames.
//!
//! The raw length check runs before parsing; the depth bound, forbidden-key
//! scan and required-field checks run on the parsed value.

use {serde_json::Value, thiserror::Error};

/// Keys rejected anywhere in a frame (prototype pollution vectors for JS peers).
pub const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("nesting exceeds maximum depth of {max}")]
    TooDeep { max: usize },
    #[error("forbidden key: {key}")]
    ForbiddenKey { key: String },
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("field '{field}' must be a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct InputValidator {
    max_bytes: usize,
    max_depth: usize,
}

impl InputValidator {
    pub fn new(max_bytes: usize, max_depth: usize) -> Self {
        Self {
            max_bytes,
            max_depth,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Reject oversized input before any parsing work is done.
    pub fn check_length(&self, raw: &str) -> Result<(), ValidationError> {
        if raw.len() > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size: raw.len(),
                max: self.max_bytes,
            });
        }
        Ok(())
    }

    pub fn parse(&self, raw: &str) -> Result<Value, ValidationError> {
        serde_json::from_str(raw).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Shape checks for a parsed frame: depth, forbidden keys, and the
    /// required primitive fields for its dialect.
    pub fn validate_frame(&self, value: &Value) -> Result<(), ValidationError> {
        let Some(obj) = value.as_object() else {
            return Err(ValidationError::NotAnObject);
        };
        self.check_structure(value)?;

        let kind = require_str(obj, "type")?;
        match kind {
            "req" => {
                require_str(obj, "id")?;
                let method = require_str(obj, "method")?;
                if method.is_empty() {
                    return Err(ValidationError::MissingField { field: "method" });
                }
                match obj.get("params") {
                    None | Some(Value::Null) | Some(Value::Object(_)) => {},
                    Some(_) => {
                        return Err(ValidationError::WrongType {
                            field: "params",
                            expected: "object",
                        });
                    },
                }
            },
            "res" => {
                require_str(obj, "id")?;
                if !obj.get("ok").is_some_and(Value::is_boolean) {
                    return Err(ValidationError::WrongType {
                        field: "ok",
                        expected: "boolean",
                    });
                }
            },
            "event" => {
                require_str(obj, "event")?;
            },
            _ => {
                if let Some(id) = obj.get("id")
                    && !id.is_string()
                    && !id.is_null()
                {
                    return Err(ValidationError::WrongType {
                        field: "id",
                        expected: "string",
                    });
                }
            },
        }
        Ok(())
    }

    /// Walk the whole graph iteratively checking depth and forbidden keys.
    fn check_structure(&self, root: &Value) -> Result<(), ValidationError> {
        let mut stack: Vec<(&Value, usize)> = vec![(root, 1)];
        while let Some((value, depth)) = stack.pop() {
            match value {
                Value::Object(map) => {
                    if depth > self.max_depth {
                        return Err(ValidationError::TooDeep {
                            max: self.max_depth,
                        });
                    }
                    for (key, child) in map {
                        if FORBIDDEN_KEYS.contains(&key.as_str()) {
                            return Err(ValidationError::ForbiddenKey { key: key.clone() });
                        }
                        stack.push((child, depth + 1));
                    }
                },
                Value::Array(items) => {
                    if depth > self.max_depth {
                        return Err(ValidationError::TooDeep {
                            max: self.max_depth,
                        });
                    }
                    stack.extend(items.iter().map(|child| (child, depth + 1)));
                },
                _ => {},
            }
        }
        Ok(())
    }
}

fn require_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField { field }),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "string",
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, serde_json::json};

    fn validator() -> InputValidator {
        InputValidator::new(1024, 4)
    }

    #[test]
    fn length_checked_on_raw_bytes() {
        let v = InputValidator::new(8, 4);
        assert!(v.check_length("12345678").is_ok());
        assert_eq!(
            v.check_length("123456789"),
            Err(ValidationError::TooLarge { size: 9, max: 8 })
        );
    }

    #[test]
    fn malformed_json() {
        assert!(matches!(
            validator().parse("{not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn valid_request() {
        let frame = json!({"type": "req", "id": "1", "method": "health", "params": {}});
        assert!(validator().validate_frame(&frame).is_ok());
    }

    #[test]
    fn request_requires_string_id_and_method() {
        let v = validator();
        assert_eq!(
            v.validate_frame(&json!({"type": "req", "method": "health"})),
            Err(ValidationError::MissingField { field: "id" })
        );
        assert_eq!(
            v.validate_frame(&json!({"type": "req", "id": 5, "method": "health"})),
            Err(ValidationError::WrongType {
                field: "id",
                expected: "string"
            })
        );
        assert_eq!(
            v.validate_frame(&json!({"type": "req", "id": "1", "method": ""})),
            Err(ValidationError::MissingField { field: "method" })
        );
    }

    #[test]
    fn legacy_requires_type() {
        assert_eq!(
            validator().validate_frame(&json!({"payload": {}})),
            Err(ValidationError::MissingField { field: "type" })
        );
        assert!(
            validator()
                .validate_frame(&json!({"type": "ping", "id": "x"}))
                .is_ok()
        );
    }

    #[test]
    fn non_object_rejected() {
        assert_eq!(
            validator().validate_frame(&json!([1, 2])),
            Err(ValidationError::NotAnObject)
        );
    }

    #[test]
    fn depth_bound_enforced() {
        let v = validator();
        let ok = json!({"type": "chat", "payload": {"a": {"b": 1}}});
        assert!(v.validate_frame(&ok).is_ok());
        let deep = json!({"type": "chat", "payload": {"a": {"b": {"c": {"d": 1}}}}});
        assert_eq!(
            v.validate_frame(&deep),
            Err(ValidationError::TooDeep { max: 4 })
        );
    }

    #[test]
    fn forbidden_keys_rejected_anywhere() {
        let v = validator();
        let frame = json!({"type": "chat", "payload": {"items": [{"__proto__": {}}]}});
        assert_eq!(
            v.validate_frame(&frame),
            Err(ValidationError::ForbiddenKey {
                key: "__proto__".into()
            })
        );
        let frame = json!({"type": "req", "id": "1", "method": "x", "params": {"constructor": 1}});
        assert!(matches!(
            v.validate_frame(&frame),
            Err(ValidationError::ForbiddenKey { .. })
        ));
    }
}
