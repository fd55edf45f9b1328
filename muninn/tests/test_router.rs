//! 路由器端到端测试：脚本变换、模式校验、直通回退、背压与关闭
//! Router end-to-end tests: script transforms, schema validation,
//! passthrough fallback, backpressure and shutdown

use async_trait::async_trait;
use muninn::error::{Error, Result};
use muninn::message::{Message, Value};
use muninn::router::{Route, Router};
use muninn::storage::Sink;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

type Insert = (String, BTreeMap<String, Value>);

/// 记录所有插入的模拟存储
/// Mock sink recording every insert
#[derive(Default)]
struct MockSink {
  inserts: Mutex<Vec<Insert>>,
}

impl MockSink {
  fn snapshot(&self) -> Vec<Insert> {
    self.inserts.lock().unwrap().clone()
  }

  fn len(&self) -> usize {
    self.inserts.lock().unwrap().len()
  }
}

#[async_trait]
impl Sink for MockSink {
  async fn insert(
    &self,
    _token: &CancellationToken,
    table: &str,
    columns: &BTreeMap<String, Value>,
  ) -> Result<()> {
    self
      .inserts
      .lock()
      .unwrap()
      .push((table.to_string(), columns.clone()));
    Ok(())
  }
}

/// 阻塞到被放行为止的模拟存储，用于测试背压
/// Mock sink that blocks until released, for backpressure tests
struct BlockingSink {
  started: mpsc::UnboundedSender<()>,
  release: Arc<Notify>,
  completed: Mutex<Vec<Insert>>,
}

#[async_trait]
impl Sink for BlockingSink {
  async fn insert(
    &self,
    token: &CancellationToken,
    table: &str,
    columns: &BTreeMap<String, Value>,
  ) -> Result<()> {
    let _ = self.started.send(());
    tokio::select! {
      _ = token.cancelled() => return Err(Error::Cancelled),
      _ = self.release.notified() => {}
    }
    self
      .completed
      .lock()
      .unwrap()
      .push((table.to_string(), columns.clone()));
    Ok(())
  }
}

fn write_script(dir: &tempfile::TempDir, code: &str) -> std::path::PathBuf {
  let path = dir.path().join("transform.lua");
  let mut file = std::fs::File::create(&path).unwrap();
  file.write_all(code.as_bytes()).unwrap();
  path
}

fn msg(topic: &str, payload: &[u8]) -> Message {
  Message {
    topic: topic.to_string(),
    payload: payload.to_vec(),
    qos: 1,
    retain: false,
    time: "2024-01-01T00:00:00Z".parse().unwrap(),
  }
}

/// 轮询等待模拟存储收到 n 条插入
/// Poll until the mock sink has received n inserts
async fn wait_for_inserts(sink: &MockSink, n: usize) {
  tokio::time::timeout(Duration::from_secs(5), async {
    while sink.len() < n {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap_or_else(|_| panic!("timed out waiting for {n} inserts, got {}", sink.len()));
}

#[tokio::test]
async fn test_single_record_transform() {
  let dir = tempfile::tempdir().unwrap();
  let script = write_script(
    &dir,
    r#"
      schema = {
        tables = {
          sensor_data = { time = "timestamptz", topic = "text", value = "double precision" }
        }
      }
      function transform(msg)
        return {
          {
            table = "sensor_data",
            columns = { time = msg.ts, topic = msg.topic, value = msg.json.v }
          }
        }
      end
    "#,
  );

  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "sensors/+".into(),
      script: Some(script),
      workers: 1,
      queue_size: 4,
      table: "sensor_data".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  router.dispatch(msg("sensors/a", br#"{"v":1.5}"#)).await.unwrap();
  wait_for_inserts(&sink, 1).await;

  let inserts = sink.snapshot();
  assert_eq!(inserts[0].0, "sensor_data");
  let columns = &inserts[0].1;
  assert_eq!(
    columns.get("time"),
    Some(&Value::Text("2024-01-01T00:00:00Z".into()))
  );
  assert_eq!(columns.get("topic"), Some(&Value::Text("sensors/a".into())));
  assert_eq!(columns.get("value"), Some(&Value::Float(1.5)));

  router.close().await;
}

#[tokio::test]
async fn test_multi_table_conditional() {
  let dir = tempfile::tempdir().unwrap();
  let script = write_script(
    &dir,
    r#"
      schema = {
        tables = {
          readings = { time = "timestamptz", value = "double precision" },
          events = { time = "timestamptz", event = "text" }
        }
      }
      function transform(msg)
        local records = {
          { table = "readings", columns = { time = msg.ts, value = msg.json.v } }
        }
        if msg.json.alert == true then
          table.insert(records, {
            table = "events",
            columns = { time = msg.ts, event = "alert" }
          })
        end
        return records
      end
    "#,
  );

  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "sensors/+".into(),
      script: Some(script),
      workers: 1,
      queue_size: 4,
      table: "readings".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  router
    .dispatch(msg("sensors/a", br#"{"v":9,"alert":true}"#))
    .await
    .unwrap();
  wait_for_inserts(&sink, 2).await;

  // 两条插入按产出顺序
  // Both inserts in emission order
  let inserts = sink.snapshot();
  assert_eq!(inserts[0].0, "readings");
  assert_eq!(inserts[1].0, "events");

  router.dispatch(msg("sensors/a", br#"{"v":9}"#)).await.unwrap();
  wait_for_inserts(&sink, 3).await;
  assert_eq!(sink.snapshot()[2].0, "readings");

  router.close().await;
}

#[tokio::test]
async fn test_undeclared_column_drops_message() {
  let dir = tempfile::tempdir().unwrap();
  let script = write_script(
    &dir,
    r#"
      schema = {
        tables = {
          sensor_data = { time = "timestamptz", value = "double precision" }
        }
      }
      function transform(msg)
        if msg.json.bad then
          return {
            { columns = { time = msg.ts, value = 1 } },
            { columns = { time = msg.ts, bogus = "not declared" } }
          }
        end
        return { { columns = { time = msg.ts, value = msg.json.v } } }
      end
    "#,
  );

  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "sensors/+".into(),
      script: Some(script),
      workers: 1,
      queue_size: 4,
      table: "sensor_data".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  // 含未声明列的消息整条作废：第一条记录也不入库
  // A message with an undeclared column is voided whole: not even its first
  // record is inserted
  router
    .dispatch(msg("sensors/a", br#"{"bad":true}"#))
    .await
    .unwrap();
  // worker 继续处理下一条消息
  // The worker keeps processing the next message
  router.dispatch(msg("sensors/a", br#"{"v":2.5}"#)).await.unwrap();
  wait_for_inserts(&sink, 1).await;
  // 稍等以确认坏消息没有产生额外插入
  // Wait briefly to confirm the bad message produced no extra inserts
  tokio::time::sleep(Duration::from_millis(50)).await;

  let inserts = sink.snapshot();
  assert_eq!(inserts.len(), 1);
  assert_eq!(inserts[0].1.get("value"), Some(&Value::Float(2.5)));

  router.close().await;
}

#[tokio::test]
async fn test_passthrough_route() {
  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "legacy/#".into(),
      script: None,
      workers: 1,
      queue_size: 4,
      table: "legacy_raw".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  // 非 JSON 负载：没有 json 列
  // Non-JSON payload: no json column
  router.dispatch(msg("legacy/x", b"hello")).await.unwrap();
  wait_for_inserts(&sink, 1).await;

  let inserts = sink.snapshot();
  assert_eq!(inserts[0].0, "legacy_raw");
  let columns = &inserts[0].1;
  assert_eq!(columns.get("topic"), Some(&Value::Text("legacy/x".into())));
  assert_eq!(columns.get("qos"), Some(&Value::Integer(1)));
  assert_eq!(columns.get("retain"), Some(&Value::Bool(false)));
  assert_eq!(columns.get("raw"), Some(&Value::Text("hello".into())));
  assert!(!columns.contains_key("json"));

  // JSON 负载：多出 json 列
  // JSON payload: an extra json column
  router.dispatch(msg("legacy/x", br#"{"a":1}"#)).await.unwrap();
  wait_for_inserts(&sink, 2).await;
  let inserts = sink.snapshot();
  assert_eq!(
    inserts[1].1.get("json"),
    Some(&Value::Json(serde_json::json!({"a": 1})))
  );

  router.close().await;
}

#[tokio::test]
async fn test_passthrough_default_table_sentinel() {
  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "legacy/#".into(),
      script: None,
      workers: 1,
      queue_size: 4,
      // 默认表名保持哨兵值
      // Default table left at the sentinel
      table: String::new(),
    }],
    sink.clone(),
  )
  .unwrap();

  router.dispatch(msg("legacy/x", b"payload")).await.unwrap();
  wait_for_inserts(&sink, 1).await;

  // 直通路由的 iot_data 哨兵被替换为 iot_raw
  // The iot_data sentinel of a passthrough route is replaced by iot_raw
  assert_eq!(sink.snapshot()[0].0, "iot_raw");

  router.close().await;
}

#[tokio::test]
async fn test_no_matching_route_falls_through() {
  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "sensors/+".into(),
      script: None,
      workers: 1,
      queue_size: 4,
      table: "sensor_raw".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  // 直通回退同步写入，dispatch 返回即已入库
  // The fallback writes synchronously; the insert is recorded when
  // dispatch returns
  router.dispatch(msg("other/x", b"stray")).await.unwrap();

  let inserts = sink.snapshot();
  assert_eq!(inserts.len(), 1);
  assert_eq!(inserts[0].0, "iot_raw");
  assert_eq!(inserts[0].1.get("raw"), Some(&Value::Text("stray".into())));

  router.close().await;
}

#[tokio::test]
async fn test_queue_full_fails_fast() {
  let (started_tx, mut started_rx) = mpsc::unbounded_channel();
  let release = Arc::new(Notify::new());
  let sink = Arc::new(BlockingSink {
    started: started_tx,
    release: release.clone(),
    completed: Mutex::new(Vec::new()),
  });

  let mut router = Router::new(
    vec![Route {
      filter: "slow/+".into(),
      script: None,
      workers: 1,
      queue_size: 1,
      table: "slow_raw".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  // 第一条消息被 worker 取走并阻塞在 sink 里
  // The first message is picked up and blocks inside the sink
  router.dispatch(msg("slow/a", b"m1")).await.unwrap();
  tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
    .await
    .unwrap()
    .unwrap();

  // 第二条填满队列
  // The second fills the queue
  router.dispatch(msg("slow/a", b"m2")).await.unwrap();

  // 第三条必须立刻失败而不是阻塞
  // The third must fail immediately instead of blocking
  let result = tokio::time::timeout(
    Duration::from_millis(500),
    router.dispatch(msg("slow/a", b"m3")),
  )
  .await
  .expect("dispatch must not block on a full queue");
  assert!(matches!(result, Err(Error::QueueFull { .. })));

  // 放行后积压消息全部完成
  // After release, the backlog completes
  release.notify_waiters();
  tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
    .await
    .unwrap()
    .unwrap();
  release.notify_waiters();

  tokio::time::timeout(Duration::from_secs(5), async {
    while sink.completed.lock().unwrap().len() < 2 {
      // 唤醒可能在通知前就开始等待的插入
      // Wake inserts that started waiting before the notify
      release.notify_waiters();
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();

  router.close().await;
}

#[tokio::test]
async fn test_fifo_with_single_worker() {
  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "ordered/#".into(),
      script: None,
      workers: 1,
      queue_size: 10,
      table: "ordered_raw".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  for i in 0..5 {
    router
      .dispatch(msg("ordered/x", format!("m{i}").as_bytes()))
      .await
      .unwrap();
  }
  wait_for_inserts(&sink, 5).await;

  // 单 worker 路由严格按到达顺序处理
  // A single-worker route processes strictly in arrival order
  let raws: Vec<_> = sink
    .snapshot()
    .iter()
    .map(|(_, cols)| cols.get("raw").cloned().unwrap())
    .collect();
  let expected: Vec<_> = (0..5).map(|i| Value::Text(format!("m{i}"))).collect();
  assert_eq!(raws, expected);

  router.close().await;
}

#[tokio::test]
async fn test_first_match_wins() {
  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![
      Route {
        filter: "sensors/+".into(),
        script: None,
        workers: 1,
        queue_size: 4,
        table: "first_raw".into(),
      },
      Route {
        filter: "sensors/#".into(),
        script: None,
        workers: 1,
        queue_size: 4,
        table: "second_raw".into(),
      },
    ],
    sink.clone(),
  )
  .unwrap();

  router.dispatch(msg("sensors/a", b"x")).await.unwrap();
  wait_for_inserts(&sink, 1).await;

  // 声明顺序中第一条匹配的路由获胜
  // The first matching route in declaration order wins
  assert_eq!(sink.snapshot()[0].0, "first_raw");

  router.close().await;
}

#[tokio::test]
async fn test_script_error_does_not_kill_worker() {
  let dir = tempfile::tempdir().unwrap();
  let script = write_script(
    &dir,
    r#"
      function transform(msg)
        if msg.json == nil then
          error("expected json payload")
        end
        return { { columns = { raw = msg.payload } } }
      end
    "#,
  );

  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![Route {
      filter: "sensors/+".into(),
      script: Some(script),
      workers: 1,
      queue_size: 4,
      table: "sensor_data".into(),
    }],
    sink.clone(),
  )
  .unwrap();

  // 脚本抛错的消息被丢弃，worker 存活
  // Messages on which the script raises are dropped; the worker survives
  router.dispatch(msg("sensors/a", b"not json")).await.unwrap();
  router.dispatch(msg("sensors/a", br#"{"ok":1}"#)).await.unwrap();
  wait_for_inserts(&sink, 1).await;

  assert_eq!(sink.len(), 1);

  router.close().await;
}

#[tokio::test]
async fn test_close_joins_and_rejects_dispatch() {
  let dir = tempfile::tempdir().unwrap();
  let script = write_script(
    &dir,
    r#"function transform(msg) return { { columns = { raw = msg.payload } } } end"#,
  );

  let sink = Arc::new(MockSink::default());
  let mut router = Router::new(
    vec![
      Route {
        filter: "a/#".into(),
        script: Some(script),
        workers: 2,
        queue_size: 8,
        table: "a_data".into(),
      },
      Route {
        filter: "b/#".into(),
        script: None,
        workers: 1,
        queue_size: 8,
        table: "b_raw".into(),
      },
    ],
    sink.clone(),
  )
  .unwrap();

  router.dispatch(msg("a/1", b"x")).await.unwrap();
  router.dispatch(msg("b/1", b"y")).await.unwrap();
  wait_for_inserts(&sink, 2).await;

  // 关闭在有限时间内完成
  // Close completes in bounded time
  tokio::time::timeout(Duration::from_secs(5), router.close())
    .await
    .unwrap();

  // 关闭后的分发被拒绝
  // Dispatch after close is rejected
  let result = router.dispatch(msg("a/1", b"late")).await;
  assert!(matches!(result, Err(Error::RouterClosed)));
}

#[tokio::test]
async fn test_invalid_route_table_aborts_startup() {
  let sink = Arc::new(MockSink::default());
  let result = Router::new(
    vec![Route {
      filter: "a/#".into(),
      script: None,
      workers: 1,
      queue_size: 4,
      table: "bad-table".into(),
    }],
    sink,
  );
  assert!(result.is_err());
}

#[tokio::test]
async fn test_script_load_failure_aborts_startup() {
  let dir = tempfile::tempdir().unwrap();
  let script = write_script(&dir, "this is not lua (");

  let sink = Arc::new(MockSink::default());
  let result = Router::new(
    vec![Route {
      filter: "a/#".into(),
      script: Some(script),
      workers: 1,
      queue_size: 4,
      table: "a_data".into(),
    }],
    sink,
  );
  assert!(result.is_err());
}
