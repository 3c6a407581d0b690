//! Bee Call - 控制台通话模拟器
//!
//! 在终端里模拟一通电话：每行输入当作来电者的一句话，模型回复以 token 流打印。
//!
//! 输入约定：
//! - `!int <已播放到的那一句>`：打断当前播放
//! - `#123`：来电者按键
//! - `/send 123`：Bot 发送按键音
//! - `/agent <文本>`：注入人工坐席的系统轮次
//! - `/ctx`：打印会话上下文
//! - `/handoff`：转人工并结束
//! - `{...}`：原样作为中继 JSON 消息处理
//! - `/quit`：挂断
//!
//! 启动: cargo run -- [config.toml]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bee_call::config::load_config;
use bee_call::llm::create_llm_from_config;
use bee_call::relay::{RelayEvent, RelayMessage};
use bee_call::sync::store_from_config;
use bee_call::tools::{builtin_registry, ToolExecutor};
use bee_call::{observability, CallDeps, CallSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let deps = CallDeps {
        llm: create_llm_from_config(&cfg.llm),
        tools: Arc::new(ToolExecutor::new(builtin_registry(), cfg.tools.tool_timeout_secs)),
        sync: store_from_config(&cfg.sync),
        completion: cfg.completion_settings(),
        replication: cfg.sync.replicator_settings(),
        clause_policy: cfg.conversation.clause_policy(),
    };

    let call_id = format!("CA{}", uuid::Uuid::new_v4().simple());
    let (session, relay_rx) = CallSession::new(call_id.clone(), deps);
    let ended = CancellationToken::new();
    let printer = tokio::spawn(print_relay(relay_rx, ended.clone()));

    session.handle(RelayMessage::Setup {
        call_sid: call_id,
        from: Some("console".to_string()),
        to: cfg.app.name.clone(),
        custom_parameters: None,
    });
    if let Some(greeting) = &cfg.app.greeting {
        session.greet(greeting);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = ended.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        dispatch(&session, line);
    }

    session.shutdown(Duration::from_secs(5)).await;
    drop(session);
    let _ = printer.await;
    Ok(())
}

fn dispatch(session: &CallSession, line: &str) {
    if let Some(clause) = line.strip_prefix("!int") {
        session.handle(RelayMessage::Interrupt {
            utterance_until_interrupt: clause.trim().to_string(),
            duration_until_interrupt_ms: None,
        });
    } else if let Some(digits) = line.strip_prefix('#') {
        session.handle(RelayMessage::Dtmf {
            digit: digits.trim().to_string(),
        });
    } else if let Some(digits) = line.strip_prefix("/send ") {
        session.send_digits(digits.trim());
    } else if let Some(text) = line.strip_prefix("/agent ") {
        let _ = session.inject_system(text.trim());
    } else if line == "/ctx" {
        match serde_json::to_string_pretty(&session.context().snapshot()) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("context not printable: {e}"),
        }
    } else if line == "/handoff" {
        session.end_call(
            "live-agent-handoff",
            "caller requested a live agent",
            serde_json::json!({ "turns": session.store().len() }),
        );
    } else if line.starts_with('{') {
        match RelayMessage::parse(line) {
            Ok(message) => {
                session.handle(message);
            }
            Err(e) => eprintln!("invalid relay message: {e}"),
        }
    } else {
        session.handle(RelayMessage::Prompt {
            voice_prompt: line.to_string(),
            last: true,
        });
    }
}

async fn print_relay(mut rx: mpsc::UnboundedReceiver<RelayEvent>, ended: CancellationToken) {
    let mut speaking = false;
    while let Some(event) = rx.recv().await {
        match &event {
            RelayEvent::Text { token, last } => {
                if !speaking {
                    print!("bot> ");
                    speaking = true;
                }
                print!("{token}");
                if *last {
                    println!();
                    speaking = false;
                }
                let _ = std::io::stdout().flush();
            }
            RelayEvent::SendDigits { .. } => println!("relay> {}", event.to_wire()),
            RelayEvent::End { .. } => {
                println!("relay> {}", event.to_wire());
                ended.cancel();
            }
        }
    }
}
