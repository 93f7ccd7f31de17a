//! 会话快照持久化
//!
//! 每个会话一个 JSON 文件（<dir>/<hex(conversation_id)>.json）。读回时经 normalize_state，
//! 因此手写或旧格式（camelCase、[role, content] 数组）的快照同样可以恢复。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::core::state::{normalize_state, ConversationState};

#[derive(Debug, Clone)]
pub struct ConversationPersistence {
    dir: PathBuf,
}

impl ConversationPersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 文件名为 id 的十六进制编码：不同 id 不会落到同一文件，也无法路径穿越
    pub fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(conversation_id)))
    }

    pub fn save(&self, state: &ConversationState) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create sessions dir {}", self.dir.display()))?;
        let mapping = state.to_mapping()?;
        let path = self.path_for(state.conversation_id());
        std::fs::write(&path, serde_json::to_string_pretty(&mapping)?)
            .with_context(|| format!("write snapshot {}", path.display()))?;
        Ok(())
    }

    /// 快照不存在时返回 Ok(None)；快照中的 id 与请求不符时报错
    pub fn load(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationState>> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("read snapshot {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&data)?;
        let state = normalize_state(value)?;
        if state.conversation_id() != conversation_id {
            anyhow::bail!(
                "snapshot {} belongs to conversation {:?}, not {:?}",
                path.display(),
                state.conversation_id(),
                conversation_id
            );
        }
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Message, Role};

    #[test]
    fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let p = ConversationPersistence::new(dir.path());
        let mut state = ConversationState::new("conv-1");
        state.append_message(Message::user("hi"));
        state.append_message(Message::assistant("hello"));
        p.save(&state).unwrap();

        let restored = p.load("conv-1").unwrap().unwrap();
        assert_eq!(restored.get_messages(), state.get_messages());
        assert!(p.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_loads_legacy_pair_shape() {
        let dir = tempfile::tempdir().unwrap();
        let p = ConversationPersistence::new(dir.path());
        std::fs::write(
            p.path_for("old"),
            r#"{"conversationId":"old","messages":[["user","hi"],["assistant","hey"]]}"#,
        )
        .unwrap();
        let state = p.load("old").unwrap().unwrap();
        let roles: Vec<Role> = state.get_messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn test_path_is_sanitized() {
        let p = ConversationPersistence::new("/tmp/s");
        let path = p.path_for("../etc/passwd");
        assert_eq!(path.parent(), Some(Path::new("/tmp/s")));
        assert_eq!(path, PathBuf::from("/tmp/s/2e2e2f6574632f706173737764.json"));
    }

    #[test]
    fn test_similar_ids_do_not_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = ConversationPersistence::new(dir.path());
        assert_ne!(p.path_for("a/b"), p.path_for("a_b"));

        let mut state = ConversationState::new("a/b");
        state.append_message(Message::user("secret for a/b"));
        p.save(&state).unwrap();

        assert!(p.load("a_b").unwrap().is_none());
        assert_eq!(p.load("a/b").unwrap().unwrap().get_messages().len(), 1);
    }

    #[test]
    fn test_snapshot_with_foreign_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = ConversationPersistence::new(dir.path());
        std::fs::write(
            p.path_for("mine"),
            r#"{"conversation_id":"theirs","messages":[["user","hi"]]}"#,
        )
        .unwrap();
        assert!(p.load("mine").is_err());
    }
}
