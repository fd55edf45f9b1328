//! # Muninn
//!
//! MQTT ingestion engine with Lua transforms and PostgreSQL storage
//!
//! Muninn 是一个物联网摄取引擎：从 MQTT 经纪人消费消息，按主题
//! 过滤器路由到各自的 worker 池，可选地经过嵌入式 Lua 脚本变换为
//! 零条或多条带类型的记录，对照脚本声明的模式校验后写入 PostgreSQL。
//! Muninn is an IoT ingestion engine: it consumes messages from an MQTT
//! broker, routes them by topic filter into per-route worker pools,
//! optionally transforms them through embedded Lua scripts into zero or
//! more typed records, validates them against the script-declared schema,
//! and writes them into PostgreSQL.
//!
//! ## 特性
//! ## Features
//!
//! - MQTT 通配符路由（`+` 单层、`#` 多层），按声明顺序首条匹配
//!   - MQTT wildcard routing (`+` single level, `#` multi level), first
//!     match in declaration order
//! - 每条路由一个有界队列和固定 worker 池，入队永不阻塞
//!   - A bounded queue and fixed worker pool per route; enqueueing never
//!     blocks
//! - 每个 worker 独占一个 Lua 解释器，互不共享，无锁
//!   - One Lua interpreter exclusively owned per worker, never shared,
//!     never locked
//! - 脚本声明模式，记录列在入库前校验（按消息全有或全无）
//!   - Script-declared schemas with column validation before insert
//!     (all-or-nothing per message)
//! - 无脚本路由与未匹配消息走规范的直通记录
//!   - Script-less routes and unmatched messages take the canonical
//!     passthrough record
//! - 参数化 SQL 与标识符白名单，杜绝注入
//!   - Parameterised SQL and identifier whitelists, no injection
//! - 合并各脚本的模式并生成确定性 DDL
//!   - Merges per-script schemas and emits deterministic DDL
//! - 统一取消令牌下的优雅关闭
//!   - Graceful shutdown under a single cancellation token
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use muninn::message::Message;
//! use muninn::router::{Route, Router};
//! use muninn::storage::{Storage, StorageConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> muninn::error::Result<()> {
//! let storage = Storage::connect(StorageConfig {
//!     connection_url: "postgres://iot:pw@localhost:5432/iotdb".into(),
//!     pool_size: 4,
//!     dry_run: false,
//! })
//! .await?;
//!
//! let routes = vec![Route {
//!     filter: "sensors/+".into(),
//!     script: Some("sensors.lua".into()),
//!     workers: 2,
//!     queue_size: 100,
//!     table: "sensor_data".into(),
//! }];
//!
//! let mut router = Router::new(routes, Arc::new(storage))?;
//!
//! // 经纪人回调中分发消息
//! // Dispatch messages from the broker callback
//! router
//!     .dispatch(Message::new("sensors/a", br#"{"v":1.5}"#.to_vec(), 0, false))
//!     .await?;
//!
//! router.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod router;
pub mod schema;
pub mod script;
pub mod storage;
pub mod topic;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{Message, Record, Value};
pub use router::{Route, Router};
pub use schema::Schema;
pub use script::ScriptHost;
pub use storage::{Sink, Storage, StorageConfig};
pub use topic::topic_matches;
