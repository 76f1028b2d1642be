//! 消息头编解码
//!
//! 重试状态只保存在消息头 `x-retry-count` 中。所有修改都作用在克隆出来的
//! `FieldTable` 上，原始投递的消息头保持不变。

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

/// 重试次数
pub const X_RETRY_COUNT: &str = "x-retry-count";
/// 原始交换机
pub const X_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// 原始路由键
pub const X_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// 进入死信队列的时间（unix秒）
pub const X_FAILED_AT: &str = "x-failed-at";

/// 读取重试次数
///
/// 缺失时视为0。不同客户端写入的整数宽度不同（i8/i16/i32/i64及无符号变体），
/// 这里统一按整数读取，负数和无法识别的类型都按0处理。
pub fn retry_count(headers: &FieldTable) -> u32 {
    headers
        .inner()
        .get(X_RETRY_COUNT)
        .and_then(integer_value)
        .map(|n| n.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or(0)
}

fn integer_value(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortInt(n) => Some(i64::from(*n)),
        AMQPValue::ShortUInt(n) => Some(i64::from(*n)),
        AMQPValue::LongInt(n) => Some(i64::from(*n)),
        AMQPValue::LongUInt(n) => Some(i64::from(*n)),
        AMQPValue::LongLongInt(n) => Some(*n),
        AMQPValue::Timestamp(n) => i64::try_from(*n).ok(),
        // 部分客户端会把数字写成字符串
        AMQPValue::ShortString(s) => s.as_str().trim().parse().ok(),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    }
}

/// 生成重新发布到原队列时使用的消息头：克隆后写入新的重试次数
pub fn with_retry_count(headers: &FieldTable, retry_count: u32) -> FieldTable {
    let mut headers = headers.clone();
    headers.insert(X_RETRY_COUNT.into(), retry_count_value(retry_count));
    headers
}

/// 生成死信消息头
///
/// 保留所有原有自定义头，并标记来源交换机、来源路由键、失败时间和已观测到的重试次数。
pub fn dead_letter_headers(
    headers: &FieldTable,
    original_exchange: &str,
    original_routing_key: &str,
    failed_at: i64,
    retry_count: u32,
) -> FieldTable {
    let mut headers = headers.clone();
    headers.insert(
        X_ORIGINAL_EXCHANGE.into(),
        AMQPValue::LongString(LongString::from(original_exchange.to_string())),
    );
    headers.insert(
        X_ORIGINAL_ROUTING_KEY.into(),
        AMQPValue::LongString(LongString::from(original_routing_key.to_string())),
    );
    headers.insert(X_FAILED_AT.into(), AMQPValue::LongLongInt(failed_at));
    headers.insert(X_RETRY_COUNT.into(), retry_count_value(retry_count));
    headers
}

/// 读取字符串类型的消息头
pub fn string_header(headers: &FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key)? {
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => None,
    }
}

/// 读取整数类型的消息头
pub fn integer_header(headers: &FieldTable, key: &str) -> Option<i64> {
    headers.inner().get(key).and_then(integer_value)
}

fn retry_count_value(retry_count: u32) -> AMQPValue {
    match i32::try_from(retry_count) {
        Ok(n) => AMQPValue::LongInt(n),
        Err(_) => AMQPValue::LongLongInt(i64::from(retry_count)),
    }
}

/// 便捷构造：从键值对创建消息头
pub fn field_table<I, K>(entries: I) -> FieldTable
where
    I: IntoIterator<Item = (K, AMQPValue)>,
    K: Into<ShortString>,
{
    let mut table = FieldTable::default();
    for (key, value) in entries {
        table.insert(key.into(), value);
    }
    table
}
