//! 事件模型（EventName / Event / RawEvent）
//!
//! `Event` 为强类型事件协议；`RawEvent` 为跨越对象安全边界（`Producer`）
//! 的类型擦除形态，负载统一为 `serde_json::Value`。
//!
use crate::error::EventResult;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

/// 事件名：分发键，按值比较
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(Cow<'static, str>);

impl EventName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for EventName {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for EventName {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

impl AsRef<str> for EventName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// 事件：具名、可序列化、发布后不可变
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 事件名（分发键）
    const NAME: &'static str;

    fn event_name(&self) -> EventName {
        EventName::from_static(Self::NAME)
    }
}

/// 类型擦除后的事件
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    name: EventName,
    payload: Value,
}

impl RawEvent {
    pub fn new(name: impl Into<EventName>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// 序列化强类型事件
    pub fn from_event<E: Event>(event: &E) -> EventResult<Self> {
        Ok(Self {
            name: event.event_name(),
            payload: serde_json::to_value(event)?,
        })
    }

    pub fn name(&self) -> &EventName {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_parts(self) -> (EventName, Value) {
        (self.name, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
    }

    impl Event for OrderCreated {
        const NAME: &'static str = "order.created";
    }

    #[test]
    fn event_name_equality_is_by_value() {
        let a = EventName::from_static("order.created");
        let b = EventName::new(String::from("order.created"));
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn raw_event_carries_name_and_payload() {
        let raw = RawEvent::from_event(&OrderCreated { order_id: 7 }).unwrap();
        assert_eq!(raw.name().as_str(), "order.created");
        assert_eq!(raw.payload()["order_id"], 7);
    }
}
