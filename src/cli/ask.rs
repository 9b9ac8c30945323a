//! CLI `ask` command: submit a question to a running server and wait for the answer.

use std::time::Duration;

use anyhow::Result;

use crate::client::{poll_task, BlitzClient, PollOptions, PollOutcome};
use crate::config::BlitzConfig;
use crate::task::TaskStatus;

pub async fn ask(config: &BlitzConfig, question: &str, conversation_id: Option<&str>) -> Result<()> {
    let base_url = format!("http://{}:{}", config.server.host, config.server.port);
    let client = BlitzClient::new(&base_url)?;

    let handle = client.submit(conversation_id, question).await?;
    eprintln!(
        "Submitted (conversation {}, task {})",
        handle.conversation_id, handle.task_id
    );

    let options = PollOptions {
        interval: Duration::from_millis(500),
        // A little past the server ceiling so its timeout is what we report.
        deadline: config.tasks.timeout() + Duration::from_secs(5),
    };
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let outcome = poll_task(|| client.get_task(&handle.task_id), options, ctrl_c).await?;

    let view = match outcome {
        PollOutcome::Finished(view) => view,
        PollOutcome::Cancelled => {
            let ok = client.cancel(&handle.task_id).await?;
            eprintln!("Cancellation {}", if ok { "requested" } else { "not possible" });
            return Ok(());
        }
        PollOutcome::DeadlineExceeded(_) => {
            anyhow::bail!("no answer within {}s (task {})", options.deadline.as_secs(), handle.task_id)
        }
    };

    match view.status {
        TaskStatus::Complete => {
            if let Some(message) = view.assistant_message {
                println!("{}", message.content);
            }
        }
        TaskStatus::ClarificationNeeded => {
            println!("{}", view.clarification.unwrap_or_default());
            eprintln!("(reply with: blitz ask --conversation {} \"...\")", handle.conversation_id);
        }
        TaskStatus::Error => {
            anyhow::bail!("{}", view.error.unwrap_or_else(|| "task failed".into()))
        }
        other => eprintln!("Task ended as {other}"),
    }
    Ok(())
}
