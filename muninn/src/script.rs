//! 脚本宿主模块
//! Script host module
//!
//! 每个 worker 拥有一个独立的 Lua 解释器，用于运行用户提供的
//! transform 脚本。除 Lua 标准环境外，还注册了若干纯函数辅助工具。
//! Each worker owns an isolated Lua interpreter that runs the user-provided
//! transform script. On top of the standard Lua environment, a set of pure
//! helper functions is registered.
//!
//! 注册的辅助函数 / Registered helper functions:
//!
//! - `rot13(str) -> string` 对 ASCII 字母应用 ROT13
//!   - Applies ROT13 to ASCII alphabetic characters
//! - `base64_encode(str) -> string`
//! - `base64_decode(str) -> (string | nil, error | nil)`
//! - `hex_encode(str) -> string`
//! - `hex_decode(str) -> (string | nil, error | nil)`
//! - `hmac_sha256(key, message) -> string` 输出小写十六进制
//!   - Lowercase hex output
//! - `json_encode(value) -> (string | nil, error | nil)`
//! - `json_decode(json_string) -> (value | nil, error | nil)`
//!
//! 所有辅助函数都是纯函数，无副作用
//! All helpers are purely functional and side-effect free
//!
//! ## 并发契约 / Concurrency contract
//!
//! 解释器不可重入：一个 [`ScriptHost`] 由恰好一个 worker 独占，
//! 绝不跨 worker 共享，也绝不加锁
//! The interpreter is reentrant-hostile: a [`ScriptHost`] is exclusively
//! owned by exactly one worker, never shared across workers, never locked

use crate::error::{Error, Result};
use crate::message::{is_valid_identifier, Message, Record, Value};
use crate::schema::Schema;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::Path;

/// 脚本宿主，持有一个已加载脚本的 Lua 解释器
/// Script host holding a Lua interpreter with a loaded script
#[derive(Debug)]
pub struct ScriptHost {
  path: String,
  lua: mlua::Lua,
  schema: Schema,
}

impl ScriptHost {
  /// 加载脚本文件到全新的解释器
  /// Load a script file into a fresh interpreter
  ///
  /// 文件不可读或顶层求值出错返回 [`Error::ScriptLoad`]；
  /// 缺少全局 `transform` 函数返回 [`Error::MissingTransform`]；
  /// 随后提取可选的 `schema` 全局变量
  /// Returns [`Error::ScriptLoad`] when the file cannot be read or top-level
  /// evaluation fails; [`Error::MissingTransform`] when the `transform`
  /// global is absent; the optional `schema` global is extracted afterwards
  pub fn load<P: AsRef<Path>>(path: P) -> Result<ScriptHost> {
    let path_str = path.as_ref().display().to_string();

    let source = std::fs::read_to_string(path.as_ref())
      .map_err(|e| Error::script_load(&path_str, e.to_string()))?;

    let lua = mlua::Lua::new();
    register_helpers(&lua).map_err(|e| Error::script_load(&path_str, e.to_string()))?;

    lua
      .load(&source)
      .set_name(path_str.as_str())
      .exec()
      .map_err(|e| Error::script_load(&path_str, e.to_string()))?;

    // 在加载期探测 transform，让坏脚本在启动时就失败
    // Probe transform at load so a bad script fails at startup
    let transform: mlua::Value = lua
      .globals()
      .get("transform")
      .map_err(|e| Error::script_load(&path_str, e.to_string()))?;
    if !matches!(transform, mlua::Value::Function(_)) {
      return Err(Error::MissingTransform { path: path_str });
    }

    let schema = Schema::from_lua(&lua, &path_str)?;

    Ok(ScriptHost {
      path: path_str,
      lua,
      schema,
    })
  }

  /// 脚本文件路径
  /// Script file path
  pub fn path(&self) -> &str {
    &self.path
  }

  /// 脚本声明的模式（可能为空）
  /// The script-declared schema (possibly empty)
  pub fn schema(&self) -> &Schema {
    &self.schema
  }

  /// 对一条消息调用脚本的 transform 函数
  /// Invoke the script's transform function on a message
  ///
  /// 返回零条或多条记录；空列表表示丢弃该消息。
  /// 脚本抛错返回 [`Error::ScriptRuntime`]，返回值不是记录数组
  /// 返回 [`Error::BadTransformResult`]
  /// Returns zero or more records; the empty list drops the message. A
  /// raised script error yields [`Error::ScriptRuntime`]; a result that is
  /// not an array of records yields [`Error::BadTransformResult`]
  pub fn transform(&self, msg: &Message) -> Result<Vec<Record>> {
    let func: mlua::Value = self
      .lua
      .globals()
      .get("transform")
      .map_err(|e| Error::script_runtime(e.to_string()))?;
    let mlua::Value::Function(func) = func else {
      return Err(Error::MissingTransform {
        path: self.path.clone(),
      });
    };

    let msg_table = self
      .build_message_table(msg)
      .map_err(|e| Error::script_runtime(e.to_string()))?;

    let result: mlua::Value = func
      .call(msg_table)
      .map_err(|e| Error::script_runtime(e.to_string()))?;

    parse_records(&result)
  }

  /// 构建传递给脚本的消息表
  /// Build the message table handed to the script
  ///
  /// 字段：`topic`、`payload`（原始字节）、`ts`（RFC3339 UTC）、
  /// `json`（解析后的 JSON 树，负载不是 JSON 时为 nil）
  /// Fields: `topic`, `payload` (raw bytes), `ts` (RFC3339 UTC), `json`
  /// (parsed JSON tree, or nil when the payload is not JSON)
  fn build_message_table(&self, msg: &Message) -> mlua::Result<mlua::Table> {
    let table = self.lua.create_table()?;
    table.raw_set("topic", msg.topic.as_str())?;
    table.raw_set("payload", self.lua.create_string(&msg.payload)?)?;
    table.raw_set(
      "ts",
      msg.time.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
    )?;

    match msg.payload_json() {
      Some(json) => table.raw_set("json", json_to_lua(&self.lua, &json)?)?,
      None => table.raw_set("json", mlua::Value::Nil)?,
    }

    Ok(table)
  }
}

/// 将 transform 的返回值解析为记录数组
/// Parse the transform return value into an array of records
fn parse_records(result: &mlua::Value) -> Result<Vec<Record>> {
  let mlua::Value::Table(tbl) = result else {
    return Err(Error::bad_transform(
      "transform must return a table (array of records)",
    ));
  };

  let len = tbl.raw_len();
  let mut records = Vec::with_capacity(len);

  for i in 1..=len {
    let rec_value: mlua::Value = tbl
      .raw_get(i)
      .map_err(|e| Error::bad_transform(e.to_string()))?;
    let mlua::Value::Table(rec_table) = rec_value else {
      return Err(Error::bad_transform(format!("record {i} is not a table")));
    };

    let mut record = Record::default();

    let table_value: mlua::Value = rec_table
      .raw_get("table")
      .map_err(|e| Error::bad_transform(e.to_string()))?;
    if let mlua::Value::String(name) = table_value {
      record.table = Some(name.to_string_lossy().into());
    }

    let columns_value: mlua::Value = rec_table
      .raw_get("columns")
      .map_err(|e| Error::bad_transform(e.to_string()))?;
    let mlua::Value::Table(columns) = columns_value else {
      return Err(Error::bad_transform(format!(
        "record {i} missing 'columns' table"
      )));
    };

    for pair in columns.pairs::<mlua::Value, mlua::Value>() {
      let (key, value) = pair.map_err(|e| Error::bad_transform(e.to_string()))?;
      let mlua::Value::String(key) = key else {
        continue;
      };
      let name: String = key.to_string_lossy().into();
      // 非法列名静默跳过
      // Invalid column names are silently dropped
      if !is_valid_identifier(&name) {
        continue;
      }
      record.columns.insert(name, lua_to_value(&value));
    }

    records.push(record);
  }

  Ok(records)
}

/// 将 Lua 值转换为列值
/// Convert a Lua value into a column value
///
/// 表根据正整数序列长度判定为数组或映射，嵌套结构装入 JSON
/// Tables are treated as arrays or maps by their sequence length; nested
/// structures ride in JSON
fn lua_to_value(value: &mlua::Value) -> Value {
  match value {
    mlua::Value::Nil => Value::Null,
    mlua::Value::Boolean(b) => Value::Bool(*b),
    mlua::Value::Integer(i) => Value::Integer(*i),
    mlua::Value::Number(n) => Value::Float(*n),
    mlua::Value::String(s) => Value::Text(s.to_string_lossy().into()),
    mlua::Value::Table(t) => Value::Json(lua_table_to_json(t)),
    _ => Value::Null,
  }
}

/// 将 Lua 值转换为 JSON 值
/// Convert a Lua value into a JSON value
fn lua_to_json(value: &mlua::Value) -> serde_json::Value {
  match value {
    mlua::Value::Boolean(b) => serde_json::Value::Bool(*b),
    mlua::Value::Integer(i) => serde_json::Value::from(*i),
    mlua::Value::Number(n) => serde_json::Number::from_f64(*n)
      .map(serde_json::Value::Number)
      .unwrap_or(serde_json::Value::Null),
    mlua::Value::String(s) => serde_json::Value::String(s.to_string_lossy().into()),
    mlua::Value::Table(t) => lua_table_to_json(t),
    _ => serde_json::Value::Null,
  }
}

/// 将 Lua 表转换为 JSON 数组或对象
/// Convert a Lua table into a JSON array or object
fn lua_table_to_json(table: &mlua::Table) -> serde_json::Value {
  let len = table.raw_len();
  if len > 0 {
    let mut array = Vec::with_capacity(len);
    for i in 1..=len {
      let value: mlua::Value = table.raw_get(i).unwrap_or(mlua::Value::Nil);
      array.push(lua_to_json(&value));
    }
    return serde_json::Value::Array(array);
  }

  let mut map = serde_json::Map::new();
  for pair in table.pairs::<mlua::Value, mlua::Value>() {
    let Ok((key, value)) = pair else {
      continue;
    };
    // 非字符串键跳过
    // Non-string keys are skipped
    let mlua::Value::String(key) = key else {
      continue;
    };
    map.insert(key.to_string_lossy().into(), lua_to_json(&value));
  }
  serde_json::Value::Object(map)
}

/// 将 JSON 值转换为 Lua 值
/// Convert a JSON value into a Lua value
///
/// JSON 数字一律呈现为 Lua 浮点数
/// JSON numbers always surface as Lua floats
fn json_to_lua(lua: &mlua::Lua, value: &serde_json::Value) -> mlua::Result<mlua::Value> {
  match value {
    serde_json::Value::Null => Ok(mlua::Value::Nil),
    serde_json::Value::Bool(b) => Ok(mlua::Value::Boolean(*b)),
    serde_json::Value::Number(n) => Ok(mlua::Value::Number(n.as_f64().unwrap_or(0.0))),
    serde_json::Value::String(s) => Ok(mlua::Value::String(lua.create_string(s)?)),
    serde_json::Value::Array(arr) => {
      let table = lua.create_table_with_capacity(arr.len(), 0)?;
      for (i, element) in arr.iter().enumerate() {
        table.raw_set(i + 1, json_to_lua(lua, element)?)?;
      }
      Ok(mlua::Value::Table(table))
    }
    serde_json::Value::Object(map) => {
      let table = lua.create_table_with_capacity(0, map.len())?;
      for (key, element) in map {
        table.raw_set(key.as_str(), json_to_lua(lua, element)?)?;
      }
      Ok(mlua::Value::Table(table))
    }
  }
}

/// 向 Lua 状态注册辅助函数
/// Register helper functions into the Lua state
fn register_helpers(lua: &mlua::Lua) -> mlua::Result<()> {
  let globals = lua.globals();

  // rot13(s)
  globals.set(
    "rot13",
    lua.create_function(|_, s: String| Ok(rot13(&s)))?,
  )?;

  // base64_encode(s)
  globals.set(
    "base64_encode",
    lua.create_function(|_, s: mlua::String| Ok(BASE64.encode(&*s.as_bytes())))?,
  )?;

  // base64_decode(s) -> (decoded, err)
  globals.set(
    "base64_decode",
    lua.create_function(|lua, s: String| match BASE64.decode(&s) {
      Ok(data) => Ok((Some(lua.create_string(&data)?), None::<String>)),
      Err(e) => Ok((None, Some(e.to_string()))),
    })?,
  )?;

  // hex_encode(s)
  globals.set(
    "hex_encode",
    lua.create_function(|_, s: mlua::String| Ok(hex::encode(&*s.as_bytes())))?,
  )?;

  // hex_decode(s) -> (decoded, err)
  globals.set(
    "hex_decode",
    lua.create_function(|lua, s: String| match hex::decode(&s) {
      Ok(data) => Ok((Some(lua.create_string(&data)?), None::<String>)),
      Err(e) => Ok((None, Some(e.to_string()))),
    })?,
  )?;

  // hmac_sha256(key, message) -> hex
  globals.set(
    "hmac_sha256",
    lua.create_function(|_, (key, message): (mlua::String, mlua::String)| {
      let mut mac = Hmac::<Sha256>::new_from_slice(&key.as_bytes())
        .map_err(mlua::Error::external)?;
      mac.update(&message.as_bytes());
      Ok(hex::encode(mac.finalize().into_bytes()))
    })?,
  )?;

  // json_encode(value) -> (json_string, err)
  globals.set(
    "json_encode",
    lua.create_function(|_, value: mlua::Value| {
      match serde_json::to_string(&lua_to_json(&value)) {
        Ok(s) => Ok((Some(s), None::<String>)),
        Err(e) => Ok((None, Some(e.to_string()))),
      }
    })?,
  )?;

  // json_decode(json_string) -> (value, err)
  globals.set(
    "json_decode",
    lua.create_function(|lua, s: String| match serde_json::from_str::<serde_json::Value>(&s) {
      Ok(json) => Ok((json_to_lua(lua, &json)?, None::<String>)),
      Err(e) => Ok((mlua::Value::Nil, Some(e.to_string()))),
    })?,
  )?;

  Ok(())
}

/// 对字符串中的 ASCII 字母应用 ROT13
/// Apply ROT13 to ASCII alphabetic characters in a string
fn rot13(s: &str) -> String {
  s.chars()
    .map(|c| match c {
      'a'..='z' => (b'a' + (c as u8 - b'a' + 13) % 26) as char,
      'A'..='Z' => (b'A' + (c as u8 - b'A' + 13) % 26) as char,
      _ => c,
    })
    .collect()
}
