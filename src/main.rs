//! Cloudstash backup tool
//!
//! Provides CLI interface for storing, listing, fetching and removing backups
//! in an S3-compatible bucket

// cloudstash/src/main.rs
use anyhow::{Context, Result};
use cloudstash::archive::load_archive;
use cloudstash::{AppConfig, BackupAgent, BackupRecord};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable overriding the config file location.
const CONFIG_ENV: &str = "CLOUDSTASH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

async fn run_app() -> Result<()> {
    let config_path = env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().skip(1).collect();
    let (choice, rest) = match args.split_first() {
        Some((first, rest)) => (first.trim().to_string(), rest.to_vec()),
        None => (prompt_choice()?, Vec::new()),
    };

    let agent = BackupAgent::start(app_config.connection.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to connect to bucket {}",
                app_config.connection.bucket_name()
            )
        })?;

    let outcome = run_command(&agent, &choice, &rest).await;
    // Always stop the storage thread, but report the command's failure first.
    let stopped = agent.shutdown().await.context("Failed to stop storage gateway");
    outcome?;
    stopped
}

async fn run_command(agent: &BackupAgent, choice: &str, args: &[String]) -> Result<()> {
    match choice {
        "1" | "store" => {
            let source = arg_or_prompt(args, 0, "Archive file or directory to store")?;
            let backup_id = match args.get(1) {
                Some(id) => id.clone(),
                None => uuid::Uuid::new_v4().to_string(),
            };
            let metadata = match args.get(2) {
                Some(path) => load_metadata(Path::new(path))?,
                None => Map::new(),
            };
            println!("🚀 Storing {} as backup {}...", source, backup_id);
            run_store(agent, Path::new(&source), &backup_id, metadata).await
        }
        "2" | "list" => {
            println!("📋 Listing backups in {}...", agent.name());
            run_list(agent).await
        }
        "3" | "fetch" => {
            let backup_id = arg_or_prompt(args, 0, "Backup id to fetch")?;
            let destination = arg_or_prompt(args, 1, "Destination file")?;
            println!("⬇️ Fetching backup {} to {}...", backup_id, destination);
            run_fetch(agent, &backup_id, Path::new(&destination)).await
        }
        "4" | "remove" => {
            let backup_id = arg_or_prompt(args, 0, "Backup id to remove")?;
            println!("🗑️ Removing backup {}...", backup_id);
            agent
                .remove(&backup_id)
                .await
                .with_context(|| format!("Failed to remove backup {}", backup_id))
        }
        "5" | "check" => {
            println!("🔎 Checking access to {}...", agent.name());
            agent
                .check()
                .await
                .with_context(|| format!("Bucket check failed for {}", agent.name()))?;
            println!("✓ Bucket {} is reachable", agent.name());
            Ok(())
        }
        _ => {
            println!(
                "❌ Invalid choice. Please enter '1' (store), '2' (list), '3' (fetch), \
                 '4' (remove), or '5' (check)."
            );
            anyhow::bail!("Invalid operation choice");
        }
    }
}

async fn run_store(
    agent: &BackupAgent,
    source: &Path,
    backup_id: &str,
    metadata: Map<String, Value>,
) -> Result<()> {
    let source_owned = source.to_path_buf();
    let archive = tokio::task::spawn_blocking(move || load_archive(&source_owned))
        .await
        .context("Archive loading task failed")??;

    let record = agent
        .store(backup_id, archive, metadata)
        .await
        .with_context(|| format!("Failed to store backup {}", backup_id))?;
    println!("✓ Stored {} ({} bytes)", record.archive_key, record.size);
    Ok(())
}

async fn run_list(agent: &BackupAgent) -> Result<()> {
    let records = agent.list().await.context("Failed to list backups")?;
    if records.is_empty() {
        println!("No backups found.");
        return Ok(());
    }
    for record in &records {
        print_record(record);
    }
    println!("{} backup(s)", records.len());
    Ok(())
}

fn print_record(record: &BackupRecord) {
    let label = record
        .metadata
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("-");
    println!(
        "  {}  {:>12} bytes  {}  {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.size,
        record.backup_id,
        label
    );
}

async fn run_fetch(agent: &BackupAgent, backup_id: &str, destination: &Path) -> Result<()> {
    let mut stream = agent
        .fetch(backup_id)
        .await
        .with_context(|| format!("Failed to fetch backup {}", backup_id))?;

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create parent directory: {}", parent.display())
        })?;
    }
    let mut file = tokio::fs::File::create(destination)
        .await
        .with_context(|| format!("Failed to create output file: {}", destination.display()))?;

    let mut total_bytes: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let data = chunk.with_context(|| format!("Failed while downloading backup {}", backup_id))?;
        file.write_all(&data)
            .await
            .with_context(|| format!("Failed to write to {}", destination.display()))?;
        total_bytes += data.len() as u64;
    }
    file.flush().await.context("Failed to flush output file")?;

    println!("✓ Wrote {} bytes to {}", total_bytes, destination.display());
    Ok(())
}

/// Reads a JSON object of extra metadata to store alongside the archive.
fn load_metadata(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata file at {}", path.display()))?;
    match serde_json::from_str::<Value>(&content)
        .with_context(|| format!("Failed to parse metadata file {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("Metadata file {} must contain a JSON object", path.display()),
    }
}

fn arg_or_prompt(args: &[String], index: usize, label: &str) -> Result<String> {
    match args.get(index) {
        Some(value) => Ok(value.clone()),
        None => {
            let value = prompt_line(label)?;
            if value.is_empty() {
                anyhow::bail!("{} is required", label);
            }
            Ok(value)
        }
    }
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Store a backup (or type 'store')");
    println!("2. List backups (or type 'list')");
    println!("3. Fetch a backup (or type 'fetch')");
    println!("4. Remove a backup (or type 'remove')");
    println!("5. Check bucket access (or type 'check')");
    prompt_line("Enter your choice")
}

fn prompt_line(label: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{}: ", label);
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
