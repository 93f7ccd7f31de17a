//! Streaming Emitter
//!
//! 把路由器的一轮输出转成有序事件序列。StreamingEmitter 保证每轮恰好一个终止事件：
//! 终止后的调用被忽略；未终止就被丢弃时在 Drop 中补发 error。消费端断开不影响路由器继续收尾。

use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;

use crate::supervisor::StreamEvent;

/// 建立一轮的事件通道
pub fn channel(conversation_id: impl Into<String>) -> (StreamingEmitter, TurnStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamingEmitter {
            tx: Some(tx),
            conversation_id: conversation_id.into(),
            terminated: false,
            chunks: 0,
        },
        TurnStream { rx, finished: false },
    )
}

pub struct StreamingEmitter {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    conversation_id: String,
    terminated: bool,
    chunks: usize,
}

impl StreamingEmitter {
    /// 没有消费端的 emitter（后台轮次 / 测试）
    pub fn detached(conversation_id: impl Into<String>) -> Self {
        Self {
            tx: None,
            conversation_id: conversation_id.into(),
            terminated: false,
            chunks: 0,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks
    }

    /// 消费端是否还在
    pub fn has_consumer(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    fn send(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!(conversation_id = %self.conversation_id, "stream consumer gone");
            }
        }
    }

    /// 发送一段内容；终止后返回 false
    pub fn chunk(&mut self, text: impl Into<String>) -> bool {
        if self.terminated {
            tracing::warn!(conversation_id = %self.conversation_id, "chunk after terminal event dropped");
            return false;
        }
        let text = text.into();
        if text.is_empty() {
            return true;
        }
        self.chunks += 1;
        self.send(StreamEvent::Chunk { text });
        true
    }

    /// 按字符数切片发送整段文本；拼接所有 chunk 等于原文
    pub fn stream_text(&mut self, text: &str, chunk_chars: usize) {
        let size = chunk_chars.max(1);
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(size) {
            if !self.chunk(piece.iter().collect::<String>()) {
                break;
            }
        }
    }

    pub fn done(&mut self, agent: Option<String>, fallback_level: Option<String>) {
        self.terminate(StreamEvent::Done {
            conversation_id: self.conversation_id.clone(),
            agent,
            fallback_level,
        });
    }

    pub fn error(&mut self, reason: impl Into<String>, fallback_level: Option<String>) {
        self.terminate(StreamEvent::Error {
            conversation_id: self.conversation_id.clone(),
            reason: reason.into(),
            fallback_level,
        });
    }

    fn terminate(&mut self, event: StreamEvent) {
        if self.terminated {
            tracing::warn!(conversation_id = %self.conversation_id, "second terminal event dropped");
            return;
        }
        self.terminated = true;
        self.send(event);
    }
}

impl Drop for StreamingEmitter {
    fn drop(&mut self) {
        if !self.terminated {
            self.error("turn aborted", None);
        }
    }
}

/// 一轮的事件序列：惰性、有限、只能消费一次；收到终止事件后结束
pub struct TurnStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    finished: bool,
}

impl TurnStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.finished = true;
            self.rx.close();
        }
        Some(event)
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        stream::unfold(self, |mut s| async move { s.next_event().await.map(|ev| (ev, s)) })
    }

    /// 读到终止事件为止
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.next_event().await {
            events.push(ev);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_chunks_then_single_terminal() {
        let (mut emitter, stream) = channel("c1");
        emitter.stream_text("hello world", 4);
        emitter.done(Some("code".into()), None);
        emitter.done(None, None);
        emitter.error("late", None);
        assert!(!emitter.chunk("ignored"));
        drop(emitter);

        let events = stream.collect_all().await;
        let texts: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, "hello world");
        assert_eq!(events.len(), 4);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_drop_without_terminal_emits_error() {
        let (mut emitter, stream) = channel("c1");
        emitter.chunk("partial");
        drop(emitter);
        let events: Vec<StreamEvent> = stream.into_stream().collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            StreamEvent::Error { reason, .. } if reason == "turn aborted"
        ));
    }

    #[tokio::test]
    async fn test_consumer_disconnect_does_not_block() {
        let (mut emitter, stream) = channel("c1");
        drop(stream);
        assert!(!emitter.has_consumer());
        emitter.stream_text("still fine", 2);
        emitter.done(None, None);
        assert!(emitter.is_terminated());
        assert_eq!(emitter.chunks_sent(), 5);
    }

    #[test]
    fn test_unicode_chunking() {
        let mut emitter = StreamingEmitter::detached("c1");
        emitter.stream_text("你好世界", 3);
        assert_eq!(emitter.chunks_sent(), 2);
        emitter.done(None, None);
    }
}
