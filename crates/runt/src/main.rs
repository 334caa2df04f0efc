use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kernel_client::{
    plain_text, ClientConfig, KernelClient, Kernelspec, KernelspecStore, Message,
};
use log::{info, warn};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed kernelspecs
    Kernelspecs {
        /// Re-run discovery even if this process already cached a listing
        #[arg(long)]
        force: bool,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Execute code on a kernel and print what it sent back
    Exec {
        /// Code to execute
        code: String,
        /// Kernelspec name (or prefix) to launch
        #[arg(long, short, conflicts_with_all = ["echo", "connection_file"])]
        kernel: Option<String>,
        /// Connection file of an already running kernel
        #[arg(long, conflicts_with = "echo")]
        connection_file: Option<PathBuf>,
        /// Use the in-memory echo kernel
        #[arg(long)]
        echo: bool,
        /// Seconds to wait for the kernel to go idle
        #[arg(long, default_value = "30")]
        timeout: u64,
        /// Output the request's messages as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct KernelspecRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "DISPLAY NAME")]
    display_name: String,
    #[tabled(rename = "PATH")]
    path: String,
}

impl From<&Kernelspec> for KernelspecRow {
    fn from(spec: &Kernelspec) -> Self {
        KernelspecRow {
            name: spec.name.clone(),
            language: spec.language().to_string(),
            display_name: spec.display_name().to_string(),
            path: shorten_path(&spec.resource_dir),
        }
    }
}

#[derive(Serialize)]
struct ExecOutput<'a> {
    request_id: &'a str,
    state: String,
    messages: Vec<Message>,
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Kernelspecs { force, json } => list_kernelspecs(force, json).await,
        Commands::Exec {
            code,
            kernel,
            connection_file,
            echo,
            timeout,
            json,
        } => {
            let timeout = Duration::from_secs(timeout);
            let client = if echo {
                KernelClient::echo(ClientConfig::default())
            } else if let Some(path) = connection_file {
                KernelClient::connect_file(&path, ClientConfig::default()).await?
            } else {
                let name = kernel.as_deref().unwrap_or("python3");
                let store = KernelspecStore::shared();
                KernelClient::launch(&store, name, ClientConfig::default()).await?
            };
            if let Some(info) = client.connection_info() {
                info!(
                    "Connected to {} (shell {}:{}, iopub {}:{})",
                    client.kernel_id(),
                    info.ip,
                    info.shell_port,
                    info.ip,
                    info.iopub_port
                );
            }
            let result = execute(&client, &code, timeout, json).await;

            if client.launched_kernel().is_some() {
                shutdown_launched(&client, timeout).await;
            }
            client.close();
            result
        }
    }
}

async fn list_kernelspecs(force: bool, json_output: bool) -> Result<()> {
    let store = KernelspecStore::shared();
    let snapshot = store.discover(force).await?;

    if json_output {
        let specs: Vec<&Kernelspec> = snapshot.iter().collect();
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    if snapshot.is_empty() {
        println!("No kernelspecs found.");
        return Ok(());
    }

    let rows: Vec<KernelspecRow> = snapshot.iter().map(KernelspecRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

async fn execute(client: &KernelClient, code: &str, timeout: Duration, json_output: bool) -> Result<()> {
    let request = client.execute(code)?;
    info!("Sent execute_request {} to {}", request.id(), client.kernel_id());
    request.await_idle(timeout).await?;

    let messages = request.history();
    if json_output {
        let output = ExecOutput {
            request_id: request.id(),
            state: request.state().to_string(),
            messages,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for message in &messages {
        match message.msg_type() {
            "stream" => {
                let text = message.get("text").and_then(|t| t.as_str()).unwrap_or("");
                match message.get("name").and_then(|n| n.as_str()) {
                    Some("stderr") => eprint!("{}", text),
                    _ => print!("{}", text),
                }
            }
            "execute_result" | "display_data" => {
                if let Some(text) = plain_text(message) {
                    println!("{}", text);
                }
            }
            "error" => {
                let ename = message.get("ename").and_then(|v| v.as_str()).unwrap_or("Error");
                let evalue = message.get("evalue").and_then(|v| v.as_str()).unwrap_or("");
                eprintln!("{}: {}", ename, evalue);
            }
            _ => {}
        }
    }

    if let Some(reply) = request.reply() {
        let status = reply.get("status").and_then(|s| s.as_str()).unwrap_or("unknown");
        let count = reply
            .get("execution_count")
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("[{}] status={} execution_count={}", reply.msg_type(), status, count);
    }
    Ok(())
}

async fn shutdown_launched(client: &KernelClient, timeout: Duration) {
    match client.shutdown(false) {
        Ok(request) => {
            if let Err(e) = request.await_idle(timeout).await {
                warn!("Kernel did not acknowledge shutdown: {}", e);
            }
        }
        Err(e) => warn!("Failed to send shutdown_request: {}", e),
    }
}
