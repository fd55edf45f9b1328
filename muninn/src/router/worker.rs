//! worker 模块
//! Worker module
//!
//! 每个 worker 独占一个可选的脚本宿主，从路由共享的队列消费消息，
//! 依次解码、变换、校验、入库。单条消息的错误只影响它自己：
//! 记录日志后丢弃，worker 继续运行。
//! Each worker exclusively owns an optional script host and consumes
//! messages from the route's shared queue, decoding, transforming,
//! validating and dispatching in turn. An error on one message affects
//! only that message: it is logged and dropped, and the worker keeps
//! running.

use crate::error::Result;
use crate::message::{is_valid_identifier, passthrough_record, Message};
use crate::router::{Route, DEFAULT_TABLE, PASSTHROUGH_TABLE};
use crate::script::ScriptHost;
use crate::storage::Sink;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// 路由 worker
/// Route worker
pub(crate) struct Worker {
  id: usize,
  /// 脚本宿主；直通路由没有
  /// Script host; absent on passthrough routes
  host: Option<ScriptHost>,
  /// 路由的默认目标表
  /// The route's default target table
  table: String,
  sink: Arc<dyn Sink>,
  queue: Arc<Mutex<mpsc::Receiver<Message>>>,
  token: CancellationToken,
}

impl Worker {
  /// 创建 worker，必要时加载脚本
  /// Create a worker, loading the script when present
  ///
  /// 脚本加载失败会向上传播，使启动中止
  /// A script load failure propagates upward and aborts startup
  pub(crate) fn new(
    id: usize,
    route: &Route,
    sink: Arc<dyn Sink>,
    queue: Arc<Mutex<mpsc::Receiver<Message>>>,
    token: CancellationToken,
  ) -> Result<Worker> {
    let host = match &route.script {
      Some(path) => Some(ScriptHost::load(path)?),
      None => None,
    };

    Ok(Worker {
      id,
      host,
      table: route.table.clone(),
      sink,
      queue,
      token,
    })
  }

  /// worker 主循环
  /// Worker main loop
  ///
  /// 在取消信号或队列关闭时退出；脚本宿主随 worker 一起释放
  /// Exits on the cancellation signal or queue close; the script host is
  /// released together with the worker
  pub(crate) async fn run(self) {
    loop {
      let msg = {
        let mut queue = self.queue.lock().await;
        tokio::select! {
          _ = self.token.cancelled() => return,
          received = queue.recv() => match received {
            Some(msg) => msg,
            // 队列已关闭
            // Queue closed
            None => return,
          },
        }
      };

      let topic = msg.topic.clone();
      if let Err(e) = self.process(msg).await {
        tracing::error!(
          "Worker {} failed to process message from {}: {}",
          self.id,
          topic,
          e
        );
      }
    }
  }

  /// 处理单条消息
  /// Process a single message
  ///
  /// 校验先于入库：任何未声明的列使整条消息作废，本次变换产出的
  /// 所有记录都不会入库（按消息全有或全无）
  /// Validation precedes dispatch: an undeclared column voids the whole
  /// message and none of the records from this transform call are inserted
  /// (all-or-nothing per message)
  async fn process(&self, msg: Message) -> Result<()> {
    // 无脚本：直通模式
    // No script: passthrough mode
    let Some(host) = &self.host else {
      let record = passthrough_record(&msg);
      let table = if self.table == DEFAULT_TABLE {
        PASSTHROUGH_TABLE
      } else {
        self.table.as_str()
      };
      return self.sink.insert(&self.token, table, &record).await;
    };

    let records = host.transform(&msg)?;

    let mut resolved = Vec::with_capacity(records.len());
    for record in records {
      // 记录自带的表名只有通过标识符校验才生效
      // A record's own table name applies only when it passes validation
      let table = match record.table.as_deref() {
        Some(name) if is_valid_identifier(name) => name.to_string(),
        _ => self.table.clone(),
      };
      host.schema().validate(&table, &record.columns)?;
      resolved.push((table, record));
    }

    // 按产出顺序入库；存储错误使剩余记录作废
    // Insert in emission order; a storage error voids the remaining records
    for (table, record) in &resolved {
      self.sink.insert(&self.token, table, &record.columns).await?;
    }

    Ok(())
  }
}
