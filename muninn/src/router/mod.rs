//! 路由模块
//! Router module
//!
//! 按主题过滤器把入站消息分发到各路由的有界队列；每条路由拥有
//! 固定数量的 worker，未匹配的消息交给直通回退处理器。
//! Dispatches inbound messages by topic filter into per-route bounded
//! queues; each route owns a fixed pool of workers, and unmatched messages
//! go to the passthrough fallback handler.
//!
//! ## 顺序保证 / Ordering guarantees
//!
//! `workers = 1` 的路由严格按 `dispatch` 到达顺序处理（FIFO）。
//! `workers > 1` 时同一路由的消息会被不同 worker 拾取，彼此之间
//! 没有顺序保证；需要有序时把 `workers` 配置为 1。
//! A route with `workers = 1` processes strictly in `dispatch` arrival
//! order (FIFO). With `workers > 1`, messages of the same route are picked
//! up by different workers with no ordering between them; configure
//! `workers = 1` when ordering matters.

mod worker;

use crate::error::{Error, Result};
use crate::message::{is_valid_identifier, passthrough_record, Message};
use crate::storage::Sink;
use crate::topic::topic_matches;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::Worker;

/// 默认的路由目标表
/// Default route target table
pub const DEFAULT_TABLE: &str = "iot_data";
/// 直通记录的目标表
/// Target table for passthrough records
pub const PASSTHROUGH_TABLE: &str = "iot_raw";
/// 默认 worker 数
/// Default worker count
pub const DEFAULT_WORKERS: usize = 1;
/// 默认队列容量
/// Default queue capacity
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// 单条路由的配置
/// Configuration for a single route
#[derive(Debug, Clone)]
pub struct Route {
  /// MQTT 主题过滤器（如 "ruuvi/+"、"p1ib/#"）
  /// MQTT topic filter (e.g. "ruuvi/+", "p1ib/#")
  pub filter: String,
  /// Lua 脚本路径；None 表示直通模式
  /// Lua script path; None means passthrough mode
  pub script: Option<PathBuf>,
  /// worker 数量
  /// Number of workers
  pub workers: usize,
  /// 有界队列容量
  /// Bounded queue capacity
  pub queue_size: usize,
  /// 默认目标表
  /// Default target table
  pub table: String,
}

impl Route {
  /// 是否为直通路由（无脚本）
  /// Whether this is a passthrough route (no script)
  pub fn is_passthrough(&self) -> bool {
    self.script.is_none()
  }
}

/// 单条路由的处理器：一个有界队列加一组 worker
/// Handler for a single route: one bounded queue plus a worker pool
struct RouteHandler {
  route: Route,
  /// 生产者端；close 时取走以关闭队列
  /// Producer side; taken on close to shut the queue
  tx: Option<mpsc::Sender<Message>>,
  workers: Vec<JoinHandle<()>>,
}

impl RouteHandler {
  /// 创建处理器并启动其 worker
  /// Create the handler and start its workers
  fn start(mut route: Route, sink: Arc<dyn Sink>, token: CancellationToken) -> Result<RouteHandler> {
    // 应用默认值
    // Apply defaults
    if route.workers == 0 {
      route.workers = DEFAULT_WORKERS;
    }
    if route.queue_size == 0 {
      route.queue_size = DEFAULT_QUEUE_SIZE;
    }
    if route.table.is_empty() {
      route.table = DEFAULT_TABLE.to_string();
    }
    if !is_valid_identifier(&route.table) {
      return Err(Error::InvalidTableName {
        name: route.table.clone(),
      });
    }

    let (tx, rx) = mpsc::channel(route.queue_size);
    // 单生产者多消费者：worker 共享同一接收端
    // Single producer, multiple consumers: workers share one receiver
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut workers = Vec::with_capacity(route.workers);
    for id in 0..route.workers {
      let worker = Worker::new(id, &route, Arc::clone(&sink), Arc::clone(&rx), token.clone())?;
      workers.push(tokio::spawn(worker.run()));
    }

    tracing::info!(
      "Route initialized: filter={}, script={}, workers={}, queue={}, table={}",
      route.filter,
      route
        .script
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default(),
      route.workers,
      route.queue_size,
      route.table
    );

    Ok(RouteHandler {
      route,
      tx: Some(tx),
      workers,
    })
  }
}

/// 直通回退处理器，处理未匹配任何路由的消息
/// Passthrough fallback handler for messages matching no route
struct PassthroughHandler {
  sink: Arc<dyn Sink>,
  token: CancellationToken,
}

impl PassthroughHandler {
  async fn handle(&self, msg: &Message) -> Result<()> {
    let record = passthrough_record(msg);
    self
      .sink
      .insert(&self.token, PASSTHROUGH_TABLE, &record)
      .await?;
    tracing::debug!("Passthrough: stored message from {}", msg.topic);
    Ok(())
  }
}

/// 消息路由器
/// Message router
///
/// 持有全部路由处理器和直通回退；按声明顺序第一条匹配的路由
/// 接收消息
/// Owns every route handler and the passthrough fallback; the first route
/// matching in declaration order receives the message
pub struct Router {
  routes: Vec<RouteHandler>,
  passthrough: PassthroughHandler,
  token: CancellationToken,
}

impl Router {
  /// 创建路由器并启动所有 worker
  /// Create the router and start all workers
  ///
  /// 任何一条路由初始化失败（非法表名、脚本加载错误）都会使
  /// 启动失败并取消已启动的 worker
  /// Failure to initialise any route (invalid table name, script load
  /// error) aborts startup and cancels already-started workers
  pub fn new(routes: Vec<Route>, sink: Arc<dyn Sink>) -> Result<Router> {
    let token = CancellationToken::new();

    let mut handlers = Vec::with_capacity(routes.len());
    for route in routes {
      let filter = route.filter.clone();
      match RouteHandler::start(route, Arc::clone(&sink), token.clone()) {
        Ok(handler) => handlers.push(handler),
        Err(e) => {
          // 取消已启动的 worker 后原样上抛
          // Cancel already-started workers, then propagate as-is
          token.cancel();
          tracing::error!("Failed to initialize route {}: {}", filter, e);
          return Err(e);
        }
      }
    }

    Ok(Router {
      routes: handlers,
      passthrough: PassthroughHandler {
        sink,
        token: token.clone(),
      },
      token,
    })
  }

  /// 路由器共享的取消令牌
  /// The router's shared cancellation token
  pub fn cancellation_token(&self) -> CancellationToken {
    self.token.clone()
  }

  /// 把一条入站消息分发给第一条匹配的路由
  /// Dispatch an inbound message to the first matching route
  ///
  /// 入队永不阻塞：队列满时立即返回 [`Error::QueueFull`]，由调用方
  /// 决定是否重试。无匹配路由时写入直通表。
  /// Enqueueing never blocks: a full queue returns [`Error::QueueFull`]
  /// immediately and the caller decides whether to retry. Messages matching
  /// no route are written to the passthrough table.
  pub async fn dispatch(&self, msg: Message) -> Result<()> {
    if self.token.is_cancelled() {
      return Err(Error::RouterClosed);
    }

    for handler in &self.routes {
      if topic_matches(&handler.route.filter, &msg.topic) {
        let Some(tx) = &handler.tx else {
          return Err(Error::RouterClosed);
        };
        return match tx.try_send(msg) {
          Ok(()) => {
            tracing::debug!("Message dispatched to route {}", handler.route.filter);
            Ok(())
          }
          Err(TrySendError::Full(_)) => Err(Error::QueueFull {
            filter: handler.route.filter.clone(),
          }),
          Err(TrySendError::Closed(_)) => Err(Error::RouterClosed),
        };
      }
    }

    // 无匹配路由：直通回退
    // No route matched: passthrough fallback
    tracing::debug!("No route matched for {}, using passthrough", msg.topic);
    self.passthrough.handle(&msg).await
  }

  /// 关闭路由器
  /// Shut the router down
  ///
  /// 取消共享令牌，关闭每条路由的队列，然后等待全部 worker 退出；
  /// 之后的 `dispatch` 调用返回 [`Error::RouterClosed`]
  /// Cancels the shared token, closes every route queue, then joins all
  /// workers; subsequent `dispatch` calls return [`Error::RouterClosed`]
  pub async fn close(&mut self) {
    self.token.cancel();

    // 丢弃发送端即关闭队列
    // Dropping the senders closes the queues
    for handler in &mut self.routes {
      handler.tx.take();
    }

    for handler in &mut self.routes {
      for worker in handler.workers.drain(..) {
        let _ = worker.await;
      }
    }

    tracing::info!("Router closed");
  }
}
