use std::path::PathBuf;

use anyhow::{Context, Result};
use workq_adapter::create_adapter;
use workq_config::WorkItemsConfig;
use workq_domain::{SeedItem, WorkItemId};

pub async fn seed(
    payload: Option<String>,
    payload_file: Option<PathBuf>,
    files: Vec<PathBuf>,
    callid: Option<String>,
    parent: Option<String>,
) -> Result<()> {
    let payload = match (payload, payload_file) {
        (Some(inline), _) => {
            Some(serde_json::from_str(&inline).context("--payload is not valid JSON")?)
        }
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("{} is not valid JSON", path.display()))?,
            )
        }
        (None, None) => None,
    };

    let mut attachments = Vec::new();
    for path in files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("bad attachment path: {}", path.display()))?
            .to_string();
        let content =
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        attachments.push((name, content));
    }

    let config = WorkItemsConfig::from_env()?;
    let adapter = create_adapter(&config).await?;
    let item_id = adapter
        .seed_input(SeedItem {
            payload,
            parent_id: parent.map(WorkItemId::new),
            files: attachments,
            callid,
        })
        .await?;

    println!("{item_id}");
    Ok(())
}

pub async fn recover(timeout: Option<u64>) -> Result<()> {
    let config = WorkItemsConfig::from_env()?;
    let adapter = create_adapter(&config).await?;

    let recovered = adapter.recover_orphaned_work_items(timeout).await?;
    if recovered.is_empty() {
        println!("No orphaned work items found");
    } else {
        println!("Recovered {} orphaned work item(s):", recovered.len());
        for id in recovered {
            println!("  {id}");
        }
    }
    Ok(())
}

pub async fn show(id: String) -> Result<()> {
    let config = WorkItemsConfig::from_env()?;
    let adapter = create_adapter(&config).await?;
    let id = WorkItemId::new(id);

    let payload = adapter.load_payload(&id).await?;
    println!("{}", serde_json::to_string_pretty(&payload)?);

    let files = adapter.list_files(&id).await?;
    if !files.is_empty() {
        println!("files:");
        for name in files {
            println!("  {name}");
        }
    }
    Ok(())
}
