//! Task inspection commands.

use crate::app::App;
use uuid::Uuid;

pub async fn handle_list(app: &App, limit: u32, offset: u32) -> anyhow::Result<i32> {
    let tasks = app.store.list_tasks(limit, offset).await?;
    if tasks.is_empty() {
        println!("no tasks");
        return Ok(0);
    }
    println!("{:<38} {:<12} GOAL", "TASK", "BRANCH");
    for task in tasks {
        // Goals are free-form LLM-adjacent text; truncate on character
        // boundaries, not bytes.
        let goal = if task.goal.chars().count() > 60 {
            let head: String = task.goal.chars().take(57).collect();
            format!("{}...", head)
        } else {
            task.goal.clone()
        };
        println!("{:<38} {:<12} {}", task.task_id, task.active_branch, goal);
    }
    Ok(0)
}

pub async fn handle_show(app: &App, task_id: String) -> anyhow::Result<i32> {
    let task_id: Uuid = match task_id.parse() {
        Ok(id) => id,
        Err(_) => {
            eprintln!("'{}' is not a task id", task_id);
            return Ok(2);
        }
    };
    let task = app.store.get_task(task_id).await?;
    println!("task:      {}", task.task_id);
    println!("goal:      {}", task.goal);
    println!("namespace: {}", task.namespace);
    println!("created:   {}", task.created_at);
    if !task.labels.is_empty() {
        println!("labels:    {}", task.labels.join(", "));
    }
    println!("branches (active: {}):", task.active_branch);
    for branch in app.store.list_branches(task_id).await? {
        println!(
            "  {:<20} {:>4} commits  head {}",
            branch.name,
            branch.commit_count,
            branch.head_hash.as_deref().unwrap_or("-")
        );
    }
    Ok(0)
}
