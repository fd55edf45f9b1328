//! 消息与记录模块
//! Message and record module
//!
//! 定义入站消息、数据库记录以及列值的标签联合类型，
//! 并提供无脚本路由使用的直通编码器
//! Defines the inbound message, the database record, the tagged union for
//! column values, and the passthrough encoder used by script-less routes

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// 入站 MQTT 消息
/// Inbound MQTT message
///
/// `time` 在消息到达时由适配器赋值，脚本不可修改
/// `time` is stamped by the adapter on arrival; scripts cannot change it
#[derive(Debug, Clone)]
pub struct Message {
  /// 具体主题（非过滤器）
  /// Concrete topic (not a filter)
  pub topic: String,
  /// 原始负载，可能不是 UTF-8
  /// Raw payload, possibly not UTF-8
  pub payload: Vec<u8>,
  /// QoS 等级 0..2
  /// QoS level 0..2
  pub qos: u8,
  /// retain 标志
  /// Retain flag
  pub retain: bool,
  /// 到达时间（UTC）
  /// Arrival time (UTC)
  pub time: DateTime<Utc>,
}

impl Message {
  /// 创建新消息，到达时间取当前时刻
  /// Create a new message stamped with the current instant
  pub fn new<T: Into<String>, P: Into<Vec<u8>>>(topic: T, payload: P, qos: u8, retain: bool) -> Self {
    Self {
      topic: topic.into(),
      payload: payload.into(),
      qos,
      retain,
      time: Utc::now(),
    }
  }

  /// 尝试将负载解析为 JSON
  /// Try to parse the payload as JSON
  ///
  /// 解析失败不是错误；脚本会看到 `json = nil`
  /// A parse failure is not an error; the script sees `json = nil`
  pub fn payload_json(&self) -> Option<serde_json::Value> {
    serde_json::from_slice(&self.payload).ok()
  }
}

/// 列值的标签联合
/// Tagged union for column values
///
/// 嵌套的列表和映射装在 [`Value::Json`] 中，由存储层序列化为 JSON
/// Nested lists and maps ride in [`Value::Json`] and are serialised to JSON
/// by the storage layer
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Integer(i64),
  Float(f64),
  Text(String),
  Timestamp(DateTime<Utc>),
  Json(serde_json::Value),
}

impl Value {
  /// 转换为 JSON 表示（用于日志与测试）
  /// Convert to a JSON representation (for logging and tests)
  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => serde_json::Value::Bool(*b),
      Value::Integer(i) => serde_json::Value::from(*i),
      Value::Float(f) => serde_json::Number::from_f64(*f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null),
      Value::Text(s) => serde_json::Value::String(s.clone()),
      Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
      Value::Json(v) => v.clone(),
    }
  }
}

/// 待入库的数据库记录
/// A database record to be inserted
///
/// `columns` 使用 BTreeMap，保证列的迭代顺序确定
/// `columns` uses a BTreeMap so column iteration order is deterministic
#[derive(Debug, Clone, Default)]
pub struct Record {
  /// 目标表名；为空时使用路由的默认表
  /// Target table name; the route default applies when absent
  pub table: Option<String>,
  /// 列名到值的映射
  /// Column name to value mapping
  pub columns: BTreeMap<String, Value>,
}

/// 检查表名/列名是否可安全用于路由与模式层
/// Check whether a table/column name is safe for the routing and schema layers
///
/// 模式与记录层接受 `[A-Za-z0-9_]+`；存储层另有更严格的校验
/// The schema and record layers accept `[A-Za-z0-9_]+`; the storage layer
/// applies a stricter check of its own
pub fn is_valid_identifier(name: &str) -> bool {
  !name.is_empty()
    && name
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// 构建规范的直通记录
/// Build the canonical passthrough record
///
/// 固定列：`time`、`topic`、`qos`、`retain`、`raw`；
/// 仅当负载为合法 JSON 时才有 `json` 列（缺失而非 NULL）
/// Fixed columns: `time`, `topic`, `qos`, `retain`, `raw`; the `json`
/// column exists only when the payload is valid JSON (absent, not NULL)
pub fn passthrough_record(msg: &Message) -> BTreeMap<String, Value> {
  let mut record = BTreeMap::new();
  record.insert("time".to_string(), Value::Timestamp(msg.time));
  record.insert("topic".to_string(), Value::Text(msg.topic.clone()));
  record.insert("qos".to_string(), Value::Integer(i64::from(msg.qos)));
  record.insert("retain".to_string(), Value::Bool(msg.retain));
  record.insert(
    "raw".to_string(),
    Value::Text(String::from_utf8_lossy(&msg.payload).into_owned()),
  );

  if let Some(json) = msg.payload_json() {
    record.insert("json".to_string(), Value::Json(json));
  }

  record
}
