//! Type conversions between JSON and Lua.
//!
//! Payloads cross the engine boundary as JSON text; scripts see plain
//! Lua tables. A Lua table converts back as an array when it has
//! sequence entries and as an object otherwise, so an empty table
//! round-trips as `{}`.

use mlua::{Lua, Value};
use serde_json::Value as JsonValue;

/// Builds a Lua value from a JSON value.
///
/// # Errors
///
/// Propagates allocation failures from the VM.
pub fn json_to_lua(lua: &Lua, value: &JsonValue) -> mlua::Result<Value> {
    match value {
        JsonValue::Null => Ok(Value::Nil),
        JsonValue::Bool(b) => Ok(Value::Boolean(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Integer(i)),
            None => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| mlua::Error::RuntimeError("unrepresentable number".into())),
        },
        JsonValue::String(s) => Ok(Value::String(lua.create_string(s)?)),
        JsonValue::Array(arr) => {
            let table = lua.create_table()?;
            for (i, item) in arr.iter().enumerate() {
                table.raw_set(i as i64 + 1, json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        JsonValue::Object(obj) => {
            let table = lua.create_table()?;
            for (key, item) in obj {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

/// Converts a Lua value to JSON.
///
/// # Errors
///
/// Functions, userdata, and tables with non-string keys are not
/// serializable.
pub fn lua_to_json(value: Value) -> Result<JsonValue, mlua::Error> {
    match value {
        Value::Nil => Ok(JsonValue::Null),
        Value::Boolean(b) => Ok(JsonValue::Bool(b)),
        Value::Integer(i) => Ok(JsonValue::Number(i.into())),
        Value::Number(n) => serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .ok_or_else(|| mlua::Error::SerializeError("invalid number".into())),
        Value::String(s) => Ok(JsonValue::String(s.to_str()?.to_string())),
        Value::Table(table) => {
            let len = table.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: Value = table.raw_get(i)?;
                    arr.push(lua_to_json(v)?);
                }
                Ok(JsonValue::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in table.pairs::<String, Value>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_to_json(v)?);
                }
                Ok(JsonValue::Object(map))
            }
        }
        _ => Err(mlua::Error::SerializeError("unsupported type".into())),
    }
}

/// Display string for a Lua value, for the `print` hook.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => format!("{n}"),
        Value::String(s) => s
            .to_str()
            .map_or_else(|_| "<invalid utf8>".into(), |s| s.to_string()),
        Value::Table(_) => match lua_to_json(value.clone()) {
            Ok(json) => serde_json::to_string(&json).unwrap_or_else(|_| "<table>".to_string()),
            Err(_) => "<table>".to_string(),
        },
        other => format!("{other:?}"),
    }
}

/// Formats an mlua error into the message sent back to the caller.
pub fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("compile error: {message}"),
        _ => format!("{err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_through_lua() {
        let lua = Lua::new();
        let json: JsonValue = serde_json::from_str(
            r#"{"a":1,"b":2.5,"s":"text","flag":true,"none":null,"arr":[1,2,3],"nested":{"x":"y"}}"#,
        )
        .unwrap();
        let value = json_to_lua(&lua, &json).unwrap();
        let back = lua_to_json(value).unwrap();
        // null map values drop out of Lua tables, everything else survives.
        assert_eq!(back["a"], 1);
        assert_eq!(back["b"], 2.5);
        assert_eq!(back["s"], "text");
        assert_eq!(back["flag"], true);
        assert_eq!(back["arr"], serde_json::json!([1, 2, 3]));
        assert_eq!(back["nested"]["x"], "y");
    }

    #[test]
    fn empty_table_is_an_object() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        assert_eq!(lua_to_json(Value::Table(table)).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn sequence_table_is_an_array() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        table.raw_set(1, "a").unwrap();
        table.raw_set(2, "b").unwrap();
        assert_eq!(
            lua_to_json(Value::Table(table)).unwrap(),
            serde_json::json!(["a", "b"])
        );
    }

    #[test]
    fn function_is_not_serializable() {
        let lua = Lua::new();
        let func: Value = lua.load("function() end").eval().unwrap();
        assert!(lua_to_json(func).is_err());
    }

    #[test]
    fn syntax_error_formats_as_compile_error() {
        let lua = Lua::new();
        let err = lua.load("if then end").eval::<Value>().unwrap_err();
        assert!(format_lua_error(&err).contains("compile error"));
    }
}
