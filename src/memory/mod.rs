//! 记忆层：对话消息模型与会话快照持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{Message, MessageMetadata, Role, END_OF_TURN};
pub use persistence::ConversationPersistence;
