//! JSON <-> JavaScript value conversions.
//!
//! Used wherever data crosses the worker boundary: request views going in,
//! handler results, global state snapshots and console payloads coming out.
//!
//! # Type Mapping
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! Going back to JSON follows `JSON.stringify` closely: `undefined`,
//! functions and symbols become `null` at the top level and inside arrays,
//! and are dropped from objects. Integral numbers come back as JSON
//! integers.

use boa_engine::{
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context, JsString,
};
use serde_json::{Map, Number, Value as JsonValue};
use weft_common::{Result, WeftError};

/// Nesting limit for JS -> JSON conversion; also stops cyclic structures.
const MAX_DEPTH: usize = 128;

/// Convert `serde_json::Value` to a Boa `JsValue`.
///
/// # Errors
///
/// Returns `WeftError::JavaScriptExecution` if property creation or array
/// push fails.
pub fn json_to_js_value(json: &JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => Ok(JsValue::new(n.as_f64().unwrap_or(f64::NAN))),
        JsonValue::String(s) => Ok(JsValue::new(JsString::from(s.as_str()))),
        JsonValue::Array(items) => {
            let array = JsArray::new(ctx);
            for (i, item) in items.iter().enumerate() {
                let value = json_to_js_value(item, ctx)?;
                array.push(value, ctx).map_err(|e| {
                    WeftError::JavaScriptExecution(format!(
                        "Failed to push array element {}: {}",
                        i, e
                    ))
                })?;
            }
            Ok(array.into())
        }
        JsonValue::Object(map) => {
            let object = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in map {
                let value = json_to_js_value(value, ctx)?;
                object
                    .create_data_property_or_throw(JsString::from(key.as_str()), value, ctx)
                    .map_err(|e| {
                        WeftError::JavaScriptExecution(format!(
                            "Failed to set property '{}': {}",
                            key, e
                        ))
                    })?;
            }
            Ok(object.into())
        }
    }
}

/// Convert a Boa `JsValue` to `serde_json::Value`.
///
/// # Errors
///
/// Returns `WeftError::JavaScriptExecution` when a getter throws or the
/// value nests deeper than the conversion limit (which includes cycles).
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    Ok(convert(value, ctx, 0)?.unwrap_or(JsonValue::Null))
}

/// `None` means "not representable": the caller decides whether that is a
/// `null` (arrays, top level) or an omitted key (objects).
fn convert(value: &JsValue, ctx: &mut Context, depth: usize) -> Result<Option<JsonValue>> {
    if depth > MAX_DEPTH {
        return Err(WeftError::JavaScriptExecution(
            "Value is nested too deeply (or cyclic) to convert to JSON".into(),
        ));
    }

    if value.is_undefined() || value.is_symbol() {
        return Ok(None);
    }

    if value.is_null() {
        return Ok(Some(JsonValue::Null));
    }

    if let Some(b) = value.as_boolean() {
        return Ok(Some(JsonValue::Bool(b)));
    }

    if let Some(n) = value.as_number() {
        return Ok(Some(number_to_json(n)));
    }

    if let Some(s) = value.as_string() {
        return Ok(Some(JsonValue::String(s.to_std_string_escaped())));
    }

    if value.is_bigint() {
        let text = value.display().to_string();
        return Ok(Some(JsonValue::String(text.trim_end_matches('n').to_string())));
    }

    let Some(object) = value.as_object() else {
        return Ok(None);
    };
    let object = object.clone();

    if object.is_callable() {
        return Ok(None);
    }

    if object.is_array() {
        let array = JsArray::from_object(object).map_err(|e| {
            WeftError::JavaScriptExecution(format!("Object is not a valid array: {}", e))
        })?;

        let length = array.length(ctx).map_err(|e| {
            WeftError::JavaScriptExecution(format!("Failed to get array length: {}", e))
        })?;

        let mut items = Vec::with_capacity(usize::try_from(length).unwrap_or_default());
        for i in 0..length {
            let element = array.get(i, ctx).map_err(|e| {
                WeftError::JavaScriptExecution(format!("Failed to get array element {}: {}", i, e))
            })?;
            items.push(convert(&element, ctx, depth + 1)?.unwrap_or(JsonValue::Null));
        }
        return Ok(Some(JsonValue::Array(items)));
    }

    let keys = object.own_property_keys(ctx).map_err(|e| {
        WeftError::JavaScriptExecution(format!("Failed to get object keys: {}", e))
    })?;

    let mut map = Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };

        let property = object.get(key.clone(), ctx).map_err(|e| {
            WeftError::JavaScriptExecution(format!("Failed to get property '{}': {}", name, e))
        })?;

        if let Some(json) = convert(&property, ctx, depth + 1)? {
            map.insert(name, json);
        }
    }

    Ok(Some(JsonValue::Object(map)))
}

fn number_to_json(n: f64) -> JsonValue {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0 {
        return JsonValue::Number((n as i64).into());
    }
    Number::from_f64(n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    fn eval_json(source: &str) -> JsonValue {
        let mut ctx = Context::default();
        let value = ctx.eval(Source::from_bytes(source)).unwrap();
        js_value_to_json(&value, &mut ctx).unwrap()
    }

    #[test]
    fn test_roundtrip_nested_structure() {
        let mut ctx = Context::default();
        let input = json!({
            "name": "widget",
            "tags": ["a", "b"],
            "dims": {"w": 2, "h": 1.5},
            "gone": null
        });
        let js = json_to_js_value(&input, &mut ctx).unwrap();
        assert_eq!(js_value_to_json(&js, &mut ctx).unwrap(), input);
    }

    #[test]
    fn test_integers_stay_integers() {
        assert_eq!(eval_json("40 + 2"), json!(42));
        assert_eq!(eval_json("-7"), json!(-7));
        assert_eq!(eval_json("0.5"), json!(0.5));
    }

    #[test]
    fn test_non_finite_numbers_become_null() {
        assert_eq!(eval_json("NaN"), JsonValue::Null);
        assert_eq!(eval_json("[Infinity]"), json!([null]));
    }

    #[test]
    fn test_stringify_like_omissions() {
        assert_eq!(
            eval_json("({ a: 1, f: function() {}, u: undefined, s: Symbol('x') })"),
            json!({"a": 1})
        );
        assert_eq!(eval_json("[1, undefined, function() {}]"), json!([1, null, null]));
        assert_eq!(eval_json("undefined"), JsonValue::Null);
    }

    #[test]
    fn test_cyclic_value_is_an_error() {
        let mut ctx = Context::default();
        let value = ctx
            .eval(Source::from_bytes("var o = {}; o.self = o; o"))
            .unwrap();
        assert!(js_value_to_json(&value, &mut ctx).is_err());
    }
}
