//! Namespace management commands.

use crate::app::App;
use planvm_core::Namespace;

pub async fn handle_create(
    app: &App,
    name: String,
    allowed_tools: Vec<String>,
    description: Option<String>,
) -> anyhow::Result<i32> {
    if app.store.get_namespace(&name).await?.is_some() {
        eprintln!("namespace '{}' already exists, use update", name);
        return Ok(2);
    }
    let namespace = Namespace {
        name: name.clone(),
        description: description.unwrap_or_default(),
        allowed_tools,
    };
    app.store.save_namespace(&namespace).await?;
    println!("created namespace '{}'", name);
    Ok(0)
}

pub async fn handle_update(
    app: &App,
    name: String,
    allowed_tools: Option<Vec<String>>,
    description: Option<String>,
) -> anyhow::Result<i32> {
    let Some(mut namespace) = app.store.get_namespace(&name).await? else {
        eprintln!("namespace '{}' not found", name);
        return Ok(2);
    };
    if let Some(tools) = allowed_tools {
        namespace.allowed_tools = tools;
    }
    if let Some(description) = description {
        namespace.description = description;
    }
    app.store.save_namespace(&namespace).await?;
    println!("updated namespace '{}'", name);
    Ok(0)
}

pub async fn handle_delete(app: &App, name: String) -> anyhow::Result<i32> {
    app.store.delete_namespace(&name).await?;
    println!("deleted namespace '{}'", name);
    Ok(0)
}

pub async fn handle_list(app: &App) -> anyhow::Result<i32> {
    let namespaces = app.store.list_namespaces().await?;
    if namespaces.is_empty() {
        println!("no namespaces defined");
        return Ok(0);
    }
    println!("{:<24} {:<8} DESCRIPTION", "NAME", "TOOLS");
    for namespace in namespaces {
        println!(
            "{:<24} {:<8} {}",
            namespace.name,
            namespace.allowed_tools.len(),
            namespace.description
        );
    }
    Ok(0)
}

pub async fn handle_show(app: &App, name: String) -> anyhow::Result<i32> {
    let Some(namespace) = app.store.get_namespace(&name).await? else {
        eprintln!("namespace '{}' not found", name);
        return Ok(2);
    };
    println!("name:        {}", namespace.name);
    println!("description: {}", namespace.description);
    println!("tools:");
    for tool in &namespace.allowed_tools {
        println!("  - {}", tool);
    }
    Ok(0)
}
