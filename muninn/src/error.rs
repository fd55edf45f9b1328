//! 错误处理模块
//! Error handling module
//!
//! 定义了 Muninn 引擎中使用的各种错误类型
//! Defines various error types used in the Muninn engine

use thiserror::Error;

/// Muninn 引擎的结果类型
/// Result type for the Muninn engine
pub type Result<T> = std::result::Result<T, Error>;

/// Muninn 错误类型
/// Muninn error type
#[derive(Error, Debug)]
pub enum Error {
  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 无效的表名
  /// Invalid table name
  #[error("Invalid table name: {name}")]
  InvalidTableName { name: String },

  /// 无效的列名
  /// Invalid column name
  #[error("Invalid column name: {name}")]
  InvalidColumnName { name: String },

  /// 脚本加载错误
  /// Script load error
  #[error("Failed to load script {path}: {message}")]
  ScriptLoad { path: String, message: String },

  /// 脚本缺少 transform 函数
  /// Script is missing the transform function
  #[error("transform function not found in script {path}")]
  MissingTransform { path: String },

  /// transform 返回值格式错误
  /// Malformed transform return value
  #[error("Bad transform result: {message}")]
  BadTransformResult { message: String },

  /// 脚本运行时错误
  /// Script runtime error
  #[error("Script runtime error: {message}")]
  ScriptRuntime { message: String },

  /// 记录包含未声明的列
  /// Record contains an undeclared column
  #[error("Column '{column}' not declared in schema for table '{table}'")]
  UndeclaredColumn { table: String, column: String },

  /// 空记录不可入库
  /// Empty records cannot be inserted
  #[error("Empty record: no columns provided")]
  EmptyRecord,

  /// 数据库错误
  /// Database error
  #[error("Database error: {0}")]
  Storage(#[from] sea_orm::DbErr),

  /// 路由队列已满
  /// Route queue is full
  #[error("Route {filter} queue full")]
  QueueFull { filter: String },

  /// 路由器已关闭
  /// Router closed
  #[error("Router closed")]
  RouterClosed,

  /// 操作被取消
  /// Operation cancelled
  #[error("Operation cancelled")]
  Cancelled,

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// IO 错误
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建脚本加载错误
  /// Create a script load error
  pub fn script_load<P: Into<String>, S: Into<String>>(path: P, message: S) -> Self {
    Self::ScriptLoad {
      path: path.into(),
      message: message.into(),
    }
  }

  /// 创建 transform 返回值错误
  /// Create a bad transform result error
  pub fn bad_transform<S: Into<String>>(message: S) -> Self {
    Self::BadTransformResult {
      message: message.into(),
    }
  }

  /// 创建脚本运行时错误
  /// Create a script runtime error
  pub fn script_runtime<S: Into<String>>(message: S) -> Self {
    Self::ScriptRuntime {
      message: message.into(),
    }
  }

  /// 检查错误是否应终止启动（而不是仅丢弃单条消息）
  /// Check whether the error should abort startup (rather than drop a single message)
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Error::Config { .. }
        | Error::InvalidTableName { .. }
        | Error::ScriptLoad { .. }
        | Error::MissingTransform { .. }
    )
  }
}
