//! The `execute` command: run one goal to a terminal state.

use crate::app::App;
use planvm_core::ResponseFormat;
use planvm_engine::CancellationToken;

pub async fn handle(
    app: &App,
    goal: String,
    response_format: Option<String>,
    namespace: String,
) -> anyhow::Result<i32> {
    let response_format: ResponseFormat = match response_format {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("invalid --response-format: {}", e);
                return Ok(2);
            }
        },
        None => ResponseFormat::default(),
    };

    // Ctrl-C flips the task's cancellation signal; the engine polls it
    // before every dispatch and writes a terminal Manual commit.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling...");
                cancel.cancel();
            }
        });
    }

    let engine = app.engine()?;
    match engine
        .execute_goal(&goal, &namespace, response_format, &cancel)
        .await
    {
        Ok(outcome) if outcome.goal_completed => {
            println!("task:   {}", outcome.task_id);
            println!("branch: {}", outcome.branch);
            match outcome.final_answer {
                Some(serde_json::Value::String(text)) => println!("answer: {}", text),
                Some(other) => println!("answer: {}", other),
                None => {}
            }
            Ok(0)
        }
        Ok(outcome) => {
            println!("task:   {}", outcome.task_id);
            println!("branch: {}", outcome.branch);
            match outcome.error {
                Some(error) => eprintln!("failed: {} ({:?})", error.message, error.kind),
                None => eprintln!("failed: task ended without a final answer"),
            }
            Ok(4)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            Ok(e.exit_code())
        }
    }
}
