//! 模式注册模块
//! Schema registry module
//!
//! 解析脚本声明的 `schema` 全局变量，校验记录列，
//! 合并多个模式并生成确定性的 DDL
//! Parses the script-declared `schema` global, validates record columns,
//! merges multiple schemas and emits deterministic DDL

use crate::error::{Error, Result};
use crate::message::{is_valid_identifier, Value};
use std::collections::BTreeMap;

/// 单个数据库表的模式
/// Schema for a single database table
///
/// 列使用 BTreeMap 存储，DDL 输出因而天然按字典序排列
/// Columns live in a BTreeMap so DDL output is lexicographic by construction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
  /// 表名
  /// Table name
  pub name: String,
  /// 列名到 SQL 类型字符串的映射；类型字符串不做解析
  /// Column name to SQL type string; type strings are opaque
  pub columns: BTreeMap<String, String>,
}

impl TableSchema {
  /// 生成该表的 CREATE TABLE 语句
  /// Generate the CREATE TABLE statement for this table
  pub fn create_table_sql(&self) -> String {
    let mut sb = format!("CREATE TABLE IF NOT EXISTS {} (\n", self.name);

    let cols: Vec<String> = self
      .columns
      .iter()
      .map(|(name, ty)| format!("  {} {}", name, ty))
      .collect();
    sb.push_str(&cols.join(",\n"));
    if !cols.is_empty() {
      sb.push('\n');
    }
    sb.push_str(");");

    sb
  }
}

/// 脚本声明的完整模式
/// The complete schema declared by a script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
  /// 表名到表模式的映射
  /// Table name to table schema
  pub tables: BTreeMap<String, TableSchema>,
}

impl Schema {
  /// 创建空模式
  /// Create an empty schema
  pub fn new() -> Self {
    Self::default()
  }

  /// 模式是否为空
  /// Whether the schema is empty
  pub fn is_empty(&self) -> bool {
    self.tables.is_empty()
  }

  /// 从已求值的 Lua 状态中提取 `schema` 全局变量
  /// Extract the `schema` global from an evaluated Lua state
  ///
  /// 缺失的 `schema` 得到空模式（直通路由合法）；
  /// 名称不符合标识符规则或类型不是字符串的条目被静默跳过
  /// A missing `schema` yields an empty schema (legal for passthrough
  /// routes); entries with invalid names or non-string types are skipped
  pub fn from_lua(lua: &mlua::Lua, path: &str) -> Result<Schema> {
    let schema_value: mlua::Value = lua
      .globals()
      .get("schema")
      .map_err(|e| Error::script_load(path, e.to_string()))?;

    let schema_table = match schema_value {
      mlua::Value::Nil => return Ok(Schema::new()),
      mlua::Value::Table(t) => t,
      _ => return Err(Error::script_load(path, "schema must be a table")),
    };

    let tables_value: mlua::Value = schema_table
      .raw_get("tables")
      .map_err(|e| Error::script_load(path, e.to_string()))?;

    let tables_table = match tables_value {
      mlua::Value::Nil => return Ok(Schema::new()),
      mlua::Value::Table(t) => t,
      _ => return Err(Error::script_load(path, "schema.tables must be a table")),
    };

    let mut schema = Schema::new();
    for pair in tables_table.pairs::<mlua::Value, mlua::Value>() {
      let (key, value) = pair.map_err(|e| Error::script_load(path, e.to_string()))?;

      let (mlua::Value::String(table_name), mlua::Value::Table(columns_table)) = (key, value)
      else {
        continue;
      };
      let table_name: String = table_name.to_string_lossy().into();
      if !is_valid_identifier(&table_name) {
        continue;
      }

      let mut table = TableSchema {
        name: table_name.clone(),
        columns: BTreeMap::new(),
      };
      for col_pair in columns_table.pairs::<mlua::Value, mlua::Value>() {
        let (col_key, col_value) = col_pair.map_err(|e| Error::script_load(path, e.to_string()))?;
        let (mlua::Value::String(col_name), mlua::Value::String(col_type)) = (col_key, col_value)
        else {
          continue;
        };
        let col_name: String = col_name.to_string_lossy().into();
        if !is_valid_identifier(&col_name) {
          continue;
        }
        table
          .columns
          .insert(col_name, col_type.to_string_lossy().into());
      }

      schema.tables.insert(table_name, table);
    }

    Ok(schema)
  }

  /// 从脚本文件一次性加载模式（供 DDL 生成器使用）
  /// Load a schema from a script file in one shot (for the DDL emitter)
  ///
  /// 在一个临时解释器中求值，注册了与运行时相同的辅助函数
  /// Evaluates in a throwaway interpreter with the same helper functions
  /// as the runtime host
  pub fn load_from_script<P: AsRef<std::path::Path>>(path: P) -> Result<Schema> {
    let host = crate::script::ScriptHost::load(path)?;
    Ok(host.schema().clone())
  }

  /// 校验记录的列是否都已在模式中声明
  /// Validate that every record column is declared in the schema
  ///
  /// 未声明的表不校验（模式是可选的）；列值的运行时类型不与
  /// SQL 类型字符串比对
  /// Undeclared tables are not validated (schemas are opt-in); runtime value
  /// types are never checked against the SQL type strings
  pub fn validate(&self, table: &str, columns: &BTreeMap<String, Value>) -> Result<()> {
    let Some(table_schema) = self.tables.get(table) else {
      return Ok(());
    };

    for column in columns.keys() {
      if !table_schema.columns.contains_key(column) {
        return Err(Error::UndeclaredColumn {
          table: table.to_string(),
          column: column.clone(),
        });
      }
    }
    Ok(())
  }

  /// 合并多个模式
  /// Merge multiple schemas
  ///
  /// 同名表取列的并集；重复列保留先出现的类型（不覆盖）
  /// Tables with the same name union their columns; a repeated column keeps
  /// the first-seen type (no overwrite)
  pub fn merge<I: IntoIterator<Item = Schema>>(schemas: I) -> Schema {
    let mut merged = Schema::new();
    for schema in schemas {
      for (name, table) in schema.tables {
        let entry = merged.tables.entry(name.clone()).or_insert_with(|| TableSchema {
          name,
          columns: BTreeMap::new(),
        });
        for (col, ty) in table.columns {
          entry.columns.entry(col).or_insert(ty);
        }
      }
    }
    merged
  }

  /// 为全部表生成 CREATE TABLE 语句
  /// Generate CREATE TABLE statements for every table
  ///
  /// 表和列均按字典序输出，重复调用结果一致
  /// Tables and columns are emitted in lexicographic order; repeated calls
  /// yield identical output
  pub fn generate_sql(&self) -> String {
    let statements: Vec<String> = self
      .tables
      .values()
      .map(TableSchema::create_table_sql)
      .collect();
    statements.join("\n\n")
  }
}
