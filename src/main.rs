//! Hive 命令行入口
//!
//! 逐行读取 stdin，每行作为一轮发给 Supervisor，并把流式 chunk 打印到 stdout。
//! 命令：/new 开新会话，/history 打印当前会话，/quit 退出。

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use hive::core::create_supervisor;
use hive::StreamEvent;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let supervisor = create_supervisor(config_path).context("Failed to create supervisor")?;

    let mut conversation_id = uuid::Uuid::new_v4().to_string();
    println!("hive ready (conversation {conversation_id}); /new, /history, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                supervisor.shutdown();
                break;
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();

        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                conversation_id = uuid::Uuid::new_v4().to_string();
                println!("new conversation {conversation_id}");
                continue;
            }
            "/history" => {
                for m in supervisor.history(&conversation_id).await.unwrap_or_default() {
                    println!("[{}] {}", m.role.as_str(), m.content);
                }
                continue;
            }
            _ => {}
        }

        let (_, mut turn) = supervisor.submit(Some(conversation_id.clone()), input.to_string());
        while let Some(event) = turn.next_event().await {
            match event {
                StreamEvent::Chunk { text } => {
                    print!("{text}");
                    std::io::stdout().flush().ok();
                }
                StreamEvent::Done { fallback_level, .. } => {
                    match fallback_level {
                        Some(level) => println!("\n({level})"),
                        None => println!(),
                    }
                }
                StreamEvent::Error { reason, .. } => println!("\n(error: {reason})"),
            }
        }
    }

    Ok(())
}
