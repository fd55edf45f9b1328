//! 配置模块
//! Configuration module
//!
//! 定义 TOML 配置文件的数据模型，并负责把配置（包括旧版单管道
//! 形式）映射为路由表
//! Defines the data model for the TOML configuration file and maps it
//! (including the legacy single-pipeline shape) into the routing table

use crate::error::{Error, Result};
use crate::router::{Route, DEFAULT_QUEUE_SIZE, DEFAULT_TABLE, DEFAULT_WORKERS};
use serde::Deserialize;
use std::path::Path;

/// 应用配置
/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub mqtt: MqttConfig,
  pub database: DatabaseConfig,
  /// 旧版单管道配置，映射为单条路由
  /// Legacy single-pipeline configuration, mapped to a single route
  pub pipeline: PipelineConfig,
  pub logging: LoggingConfig,
  pub routes: Vec<RouteConfig>,
}

/// MQTT 经纪人配置
/// MQTT broker configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
  pub broker: String,
  pub client_id: String,
  pub username: String,
  pub password: String,
  /// 旧版主题列表（无路由时使用）
  /// Legacy topic list (used when no routes are configured)
  pub topics: Vec<String>,
  pub qos: u8,
}

/// PostgreSQL 配置
/// PostgreSQL configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
  pub host: String,
  pub port: u16,
  pub user: String,
  pub password: String,
  pub database: String,
  pub sslmode: String,
  pub pool_size: u32,
}

/// 旧版管道配置
/// Legacy pipeline configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub lua_script: String,
  pub table_name: String,
}

/// 日志配置
/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// DEBUG、INFO 或 ERROR（大小写不敏感）
  /// DEBUG, INFO or ERROR (case-insensitive)
  pub level: String,
}

/// 单条路由配置
/// Configuration for a single route
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
  /// MQTT 主题过滤器（如 "ruuvi/+"、"p1ib/#"）
  /// MQTT topic filter (e.g. "ruuvi/+", "p1ib/#")
  pub filter: String,
  /// Lua 脚本路径，空表示直通
  /// Lua script path, empty means passthrough
  pub script: String,
  /// worker 数量，默认 1
  /// Worker count, default 1
  pub workers: usize,
  /// 队列容量，默认 100
  /// Queue capacity, default 100
  pub queue_size: usize,
  /// 默认表名，默认 iot_data
  /// Default table name, default iot_data
  pub table: String,
}

impl Config {
  /// 读取并解析 TOML 配置文件
  /// Read and parse the TOML configuration file
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let data = std::fs::read_to_string(path.as_ref())
      .map_err(|e| Error::config(format!("failed to read config file: {e}")))?;
    toml::from_str(&data).map_err(|e| Error::config(format!("failed to parse config file: {e}")))
  }

  /// 从字符串解析配置（测试用）
  /// Parse configuration from a string (for tests)
  pub fn parse(data: &str) -> Result<Config> {
    toml::from_str(data).map_err(|e| Error::config(format!("failed to parse config: {e}")))
  }

  /// 由配置构建路由表
  /// Build the routing table from the configuration
  ///
  /// 路由列表优先；否则旧版管道被映射为一条路由：过滤器取唯一的
  /// 主题，主题数不为一时取 `#`
  /// The route list takes precedence; otherwise the legacy pipeline maps to
  /// a single route whose filter is the sole topic, or `#` when the topic
  /// count is not exactly one
  pub fn build_routes(&self) -> Vec<Route> {
    if !self.routes.is_empty() {
      return self.routes.iter().map(RouteConfig::to_route).collect();
    }

    // 旧版兼容：单管道配置映射为一条路由
    // Backward compatibility: the single-pipeline config maps to one route
    if !self.pipeline.lua_script.is_empty() || !self.mqtt.topics.is_empty() {
      let filter = if self.mqtt.topics.len() == 1 {
        self.mqtt.topics[0].clone()
      } else {
        "#".to_string()
      };
      return vec![Route {
        filter,
        script: non_empty(&self.pipeline.lua_script).map(Into::into),
        workers: DEFAULT_WORKERS,
        queue_size: DEFAULT_QUEUE_SIZE,
        table: if self.pipeline.table_name.is_empty() {
          DEFAULT_TABLE.to_string()
        } else {
          self.pipeline.table_name.clone()
        },
      }];
    }

    // 无路由配置：所有消息走直通回退
    // No routes configured: everything falls through to passthrough
    Vec::new()
  }

  /// 收集所有被引用的脚本路径（DDL 生成器使用）
  /// Collect every referenced script path (used by the DDL emitter)
  pub fn script_paths(&self) -> Vec<String> {
    let mut paths: Vec<String> = self
      .routes
      .iter()
      .filter_map(|r| non_empty(&r.script).map(str::to_string))
      .collect();
    if let Some(script) = non_empty(&self.pipeline.lua_script) {
      paths.push(script.to_string());
    }
    paths
  }
}

impl RouteConfig {
  /// 转换为路由，应用默认值
  /// Convert into a route, applying defaults
  pub fn to_route(&self) -> Route {
    Route {
      filter: self.filter.clone(),
      script: non_empty(&self.script).map(Into::into),
      workers: if self.workers == 0 {
        DEFAULT_WORKERS
      } else {
        self.workers
      },
      queue_size: if self.queue_size == 0 {
        DEFAULT_QUEUE_SIZE
      } else {
        self.queue_size
      },
      table: if self.table.is_empty() {
        DEFAULT_TABLE.to_string()
      } else {
        self.table.clone()
      },
    }
  }
}

impl DatabaseConfig {
  /// 构造 PostgreSQL 连接 URL
  /// Build the PostgreSQL connection URL
  pub fn connection_url(&self) -> String {
    let mut url = format!(
      "postgres://{}:{}@{}:{}/{}",
      self.user, self.password, self.host, self.port, self.database
    );
    if !self.sslmode.is_empty() {
      url.push_str("?sslmode=");
      url.push_str(&self.sslmode);
    }
    url
  }
}

fn non_empty(s: &str) -> Option<&str> {
  if s.is_empty() {
    None
  } else {
    Some(s)
  }
}
