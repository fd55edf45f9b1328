//! 存储模块
//! Storage module
//!
//! 定义注入给 worker 的 Sink 接口，以及基于 PostgreSQL 的实现。
//! SQL 语句全部参数化，标识符在拼接前经过白名单校验。
//! Defines the Sink interface injected into workers, together with the
//! PostgreSQL implementation. All SQL is parameterised; identifiers are
//! whitelist-validated before ever reaching a statement.

use crate::error::{Error, Result};
use crate::message::Value;
use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// 存储接口，核心唯一依赖的下游操作
/// Storage interface, the single downstream operation the core depends on
///
/// Sink 被所有 worker 共享，实现必须是并发安全的
/// The sink is shared by every worker; implementations must be safe for
/// concurrent calls
#[async_trait]
pub trait Sink: Send + Sync {
  /// 向指定表插入一条记录
  /// Insert one record into the given table
  ///
  /// 实现必须拒绝不合法的标识符和空列映射，并在阻塞等待时
  /// 响应取消令牌
  /// Implementations must reject invalid identifiers and empty column maps,
  /// and honour the cancellation token while blocked
  async fn insert(
    &self,
    token: &CancellationToken,
    table: &str,
    columns: &BTreeMap<String, Value>,
  ) -> Result<()>;
}

/// 存储配置
/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
  /// PostgreSQL 连接 URL
  /// PostgreSQL connection URL
  pub connection_url: String,
  /// 连接池大小
  /// Connection pool size
  pub pool_size: u32,
  /// 干跑模式：记录 SQL 而不执行
  /// Dry-run mode: log SQL instead of executing
  pub dry_run: bool,
}

/// PostgreSQL 存储实现
/// PostgreSQL storage implementation
pub struct Storage {
  db: Option<DatabaseConnection>,
  dry_run: bool,
}

/// 检查标识符是否可安全拼入 SQL：`[A-Za-z_][A-Za-z0-9_]*`
/// Check whether an identifier is safe to splice into SQL:
/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_sql_identifier(name: &str) -> bool {
  let mut bytes = name.bytes();
  match bytes.next() {
    Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
    _ => return false,
  }
  bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl Storage {
  /// 建立存储连接
  /// Establish the storage connection
  ///
  /// 干跑模式下不连接数据库
  /// Dry-run mode never touches the database
  pub async fn connect(config: StorageConfig) -> Result<Storage> {
    if config.dry_run {
      tracing::info!("Storage initialized in dry-run mode (SQL will be logged, not executed)");
      return Ok(Storage {
        db: None,
        dry_run: true,
      });
    }

    let mut options = ConnectOptions::new(config.connection_url);
    options.max_connections(config.pool_size.max(1));
    let db = Database::connect(options).await?;

    // 启动时验证连接
    // Verify the connection at startup
    db.ping().await?;

    Ok(Storage {
      db: Some(db),
      dry_run: false,
    })
  }

  /// 关闭连接池
  /// Close the connection pool
  pub async fn close(self) -> Result<()> {
    if let Some(db) = self.db {
      db.close().await?;
    }
    Ok(())
  }
}

#[async_trait]
impl Sink for Storage {
  async fn insert(
    &self,
    token: &CancellationToken,
    table: &str,
    columns: &BTreeMap<String, Value>,
  ) -> Result<()> {
    let (sql, values) = build_insert(table, columns)?;

    let Some(db) = &self.db else {
      // 干跑：只记录参数化语句
      // Dry run: only log the parameterised statement
      tracing::info!("SQL (dry-run): {}", sql);
      tracing::debug!("SQL values: {:?}", values);
      return Ok(());
    };
    debug_assert!(!self.dry_run);

    let statement = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);
    tokio::select! {
      _ = token.cancelled() => Err(Error::Cancelled),
      result = db.execute(statement) => {
        result?;
        Ok(())
      }
    }
  }
}

/// 构造参数化的 INSERT 语句
/// Build the parameterised INSERT statement
///
/// 列按字典序排列（确定性输出）；表名与列名先经白名单校验；
/// 空列映射被拒绝
/// Columns are emitted in lexicographic order (deterministic output); table
/// and column names are whitelist-validated first; an empty column map is
/// refused
fn build_insert(
  table: &str,
  columns: &BTreeMap<String, Value>,
) -> Result<(String, Vec<sea_orm::Value>)> {
  if columns.is_empty() {
    return Err(Error::EmptyRecord);
  }
  if !is_valid_sql_identifier(table) {
    return Err(Error::InvalidTableName {
      name: table.to_string(),
    });
  }

  let mut names = Vec::with_capacity(columns.len());
  let mut placeholders = Vec::with_capacity(columns.len());
  let mut values = Vec::with_capacity(columns.len());

  for (i, (name, value)) in columns.iter().enumerate() {
    if !is_valid_sql_identifier(name) {
      return Err(Error::InvalidColumnName { name: name.clone() });
    }
    names.push(name.as_str());
    placeholders.push(format!("${}", i + 1));
    values.push(value_to_sql(value));
  }

  let sql = format!(
    "INSERT INTO {} ({}) VALUES ({})",
    table,
    names.join(", "),
    placeholders.join(", ")
  );

  Ok((sql, values))
}

/// 将列值转换为 SQL 绑定参数
/// Convert a column value into a SQL bind parameter
///
/// 嵌套的列表与映射作为 JSON 绑定
/// Nested lists and maps bind as JSON
fn value_to_sql(value: &Value) -> sea_orm::Value {
  match value {
    Value::Null => sea_orm::Value::String(None),
    Value::Bool(b) => (*b).into(),
    Value::Integer(i) => (*i).into(),
    Value::Float(f) => (*f).into(),
    Value::Text(s) => s.clone().into(),
    Value::Timestamp(t) => (*t).into(),
    Value::Json(j) => j.clone().into(),
  }
}
