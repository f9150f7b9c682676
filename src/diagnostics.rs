//! 控制台诊断输出
//!
//! 不写任何日志文件。附带的结构化数据在输出前先经过 `sanitize`，
//! 字符串截断、数组/对象限量、嵌套限深，避免把整段工具输出刷到控制台。

use serde_json::{Map, Value};

const MAX_STRING_LEN: usize = 2048;
const MAX_ARRAY_ITEMS: usize = 8;
const MAX_OBJECT_KEYS: usize = 12;
const MAX_DEPTH: usize = 3;

/// 对任意 JSON 值做长度和深度裁剪
pub fn sanitize(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s)),
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return Value::String(format!("[array({})]", items.len()));
            }
            Value::Array(
                items
                    .iter()
                    .take(MAX_ARRAY_ITEMS)
                    .map(|item| sanitize_at(item, depth + 1))
                    .collect(),
            )
        }
        Value::Object(map) => {
            if depth >= MAX_DEPTH {
                return Value::String("[object]".to_string());
            }
            let mut out = Map::new();
            for (k, v) in map.iter().take(MAX_OBJECT_KEYS) {
                out.insert(k.clone(), sanitize_at(v, depth + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn truncate(s: &str) -> String {
    match s.char_indices().nth(MAX_STRING_LEN) {
        Some((cut, _)) => format!("{}...<truncated>", &s[..cut]),
        None => s.to_string(),
    }
}

/// 拼出一条诊断日志的文本；元数据先经过 `sanitize`
pub fn format_event(event: &str, meta: &Value) -> String {
    let has_meta = match meta {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    };
    if has_meta {
        format!("{} {}", event, sanitize(meta))
    } else {
        event.to_string()
    }
}

/// 输出一条带结构化元数据的诊断日志
pub fn log_event(level: log::Level, event: &str, meta: Value) {
    if log::log_enabled!(level) {
        log::log!(level, "{}", format_event(event, &meta));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_strings_are_truncated() {
        let long = "x".repeat(5000);
        let out = sanitize(&json!(long));
        let s = out.as_str().unwrap();
        assert!(s.ends_with("...<truncated>"));
        assert_eq!(s.len(), MAX_STRING_LEN + "...<truncated>".len());
    }

    #[test]
    fn multibyte_strings_truncate_on_char_boundary() {
        let long = "升".repeat(3000);
        let out = sanitize(&json!(long));
        let s = out.as_str().unwrap();
        assert_eq!(s.chars().filter(|&c| c == '升').count(), MAX_STRING_LEN);
    }

    #[test]
    fn arrays_and_objects_are_capped() {
        let arr: Vec<u32> = (0..20).collect();
        let out = sanitize(&json!(arr));
        assert_eq!(out.as_array().unwrap().len(), MAX_ARRAY_ITEMS);

        let mut map = Map::new();
        for i in 0..30 {
            map.insert(format!("k{:02}", i), json!(i));
        }
        let out = sanitize(&Value::Object(map));
        assert_eq!(out.as_object().unwrap().len(), MAX_OBJECT_KEYS);
    }

    #[test]
    fn deep_nesting_is_summarized() {
        let value = json!({"a": {"b": {"c": {"d": 1}, "list": [1, 2, 3]}}});
        let out = sanitize(&value);
        assert_eq!(out["a"]["b"]["c"], json!("[object]"));
        assert_eq!(out["a"]["b"]["list"], json!("[array(3)]"));
    }

    #[test]
    fn formatted_events_are_capped() {
        let line = format_event("tool failed", &json!({ "error": "y".repeat(100_000) }));
        assert!(line.starts_with("tool failed {"));
        assert!(line.contains("...<truncated>"));
        assert!(line.len() < MAX_STRING_LEN + 100);
        assert_eq!(format_event("bare", &json!({})), "bare");
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(sanitize(&json!(42)), json!(42));
        assert_eq!(sanitize(&json!(true)), json!(true));
        assert_eq!(sanitize(&Value::Null), Value::Null);
    }
}
