//! 主题匹配模块
//! Topic matching module
//!
//! 实现 MQTT 主题过滤器与具体主题的匹配，支持 `+` 和 `#` 通配符
//! Implements matching of MQTT topic filters against concrete topics,
//! supporting the `+` and `#` wildcards

/// 检查订阅过滤器是否匹配具体主题
/// Check whether a subscription filter matches a concrete topic
///
/// 支持 MQTT 通配符：`+`（单层）和 `#`（多层，只能作为最后一层）
/// Supports MQTT wildcards: `+` (single level) and `#` (multi level, last only)
///
/// - `+` 匹配恰好一层，包括两个斜杠之间的空段
///   - `+` matches exactly one level, including an empty segment between slashes
/// - `#` 匹配一层或多层剩余内容，必须是过滤器的最后一层
///   - `#` matches one or more remaining levels and must be the final level
/// - 其他层按字面量匹配
///   - Any other level matches literally
///
/// # Examples
///
/// ```
/// use muninn::topic::topic_matches;
///
/// assert!(topic_matches("ruuvi/+", "ruuvi/F0"));
/// assert!(!topic_matches("ruuvi/+", "ruuvi/F0/x"));
/// assert!(topic_matches("ruuvi/#", "ruuvi/F0/x"));
/// assert!(topic_matches("#", "anything/at/all"));
/// ```
pub fn topic_matches(filter: &str, topic: &str) -> bool {
  // 快速路径
  // Fast paths
  if filter == topic || filter == "#" {
    return true;
  }

  let fs: Vec<&str> = filter.split('/').collect();
  let ts: Vec<&str> = topic.split('/').collect();

  for (i, level) in fs.iter().enumerate() {
    if i >= ts.len() {
      // 主题提前结束；只有过滤器以 '#' 结尾才能匹配
      // Topic ended early; only match if the filter ends with '#'
      return *level == "#" && i == fs.len() - 1;
    }

    match *level {
      // '#' 匹配剩余所有层；必须是最后一层
      // '#' matches all remaining levels; must be last
      "#" => return i == fs.len() - 1,
      // '+' 匹配恰好一层（包括空段）
      // '+' matches exactly one level (including an empty segment)
      "+" => continue,
      _ => {
        if *level != ts[i] {
          return false;
        }
      }
    }
  }

  // 过滤器已消耗完；主题也必须消耗完
  // Filter consumed; the topic must also be fully consumed
  ts.len() == fs.len()
}
