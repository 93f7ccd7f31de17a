//! 单轮流式事件：用于 SSE / NDJSON 推送
//!
//! 一轮 = 零个或多个 chunk + 恰好一个终止事件（done 或 error）。消费方只做追加，不做原地替换。

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 最终回复的一小段
    Chunk { text: String },
    /// 正常结束
    Done {
        conversation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback_level: Option<String>,
    },
    /// 异常结束；已产出的 chunk（通常是降级内容）依然有效
    Error {
        conversation_id: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback_level: Option<String>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }

    /// SSE event 名
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_tagged() {
        let ev = StreamEvent::Chunk { text: "he".into() };
        assert_eq!(
            serde_json::to_string(&ev).unwrap(),
            r#"{"type":"chunk","text":"he"}"#
        );
        let done = StreamEvent::Done {
            conversation_id: "c1".into(),
            agent: None,
            fallback_level: Some("Emergency".into()),
        };
        let json = serde_json::to_string(&done).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert!(!json.contains("agent"));
        assert!(done.is_terminal());
        assert_eq!(done.name(), "done");
    }
}
