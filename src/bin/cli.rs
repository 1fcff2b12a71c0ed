//! CLI for cluster operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use kvmesh::coordinator::http::LEADER_HEADER;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

/// Leader redirects followed before giving up.
const MAX_REDIRECTS: usize = 3;

#[derive(Parser)]
#[command(name = "kvmesh")]
#[command(about = "kvmesh distributed key-value store CLI")]
#[command(version)]
struct Cli {
    /// Address of any cluster node
    #[arg(long, default_value = "127.0.0.1:7000")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key from the node's local replica
    Get { key: String },

    /// Set a key (sent to the leader)
    Set { key: String, value: String },

    /// Delete a key (sent to the leader)
    Delete { key: String },

    /// Add a node to the consensus group
    Join {
        /// Node ID
        id: String,
        /// Node address
        addr: String,
    },

    /// Remove a node from the consensus group
    Leave { id: String },

    /// Show node and cluster status
    Status,

    /// Show the partition and owners of a key
    Route { key: String },

    /// Force a snapshot on the node
    Snapshot,
}

struct Client {
    http: reqwest::Client,
    node: String,
}

impl Client {
    fn new(node: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http, node })
    }

    /// Send a request, re-sending it to the leader on a 307.
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let mut node = self.node.clone();
        for _ in 0..=MAX_REDIRECTS {
            let url = format!("http://{}{}", node, path);
            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = &body {
                request = request.json(body);
            }
            let resp = request
                .send()
                .await
                .with_context(|| format!("request to {} failed", url))?;

            let status = resp.status();
            if status == StatusCode::TEMPORARY_REDIRECT {
                let leader = resp
                    .headers()
                    .get(LEADER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match leader {
                    Some(leader) if leader != "unknown" && leader != node => {
                        eprintln!("→ redirected to leader {}", leader);
                        node = leader;
                        continue;
                    }
                    _ => bail!("no leader available, try again shortly"),
                }
            }

            let value: Value = resp.json().await.unwrap_or(Value::Null);
            if status == StatusCode::NOT_FOUND {
                bail!("not found");
            }
            if !status.is_success() {
                let message = value["error"].as_str().unwrap_or("request failed");
                bail!("{} ({})", message, status);
            }
            return Ok(value);
        }
        bail!("too many leader redirects")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new(cli.node)?;

    match cli.command {
        Commands::Get { key } => {
            let value = client.call(Method::GET, &format!("/kv/{}", key), None).await?;
            println!("{}", value["value"].as_str().unwrap_or_default());
        }

        Commands::Set { key, value } => {
            let body = json!({ "op": "set", "key": key, "value": value });
            let resp = client.call(Method::POST, "/kv", Some(body)).await?;
            println!("✓ set {} (index {}, term {})", key, resp["index"], resp["term"]);
        }

        Commands::Delete { key } => {
            let body = json!({ "op": "delete", "key": key });
            let resp = client.call(Method::POST, "/kv", Some(body)).await?;
            println!("✓ deleted {} (index {})", key, resp["index"]);
        }

        Commands::Join { id, addr } => {
            let body = json!({ "id": id, "addr": addr });
            client.call(Method::POST, "/join", Some(body)).await?;
            println!("✓ {} joined at {}", id, addr);
        }

        Commands::Leave { id } => {
            client
                .call(Method::POST, "/leave", Some(json!({ "id": id })))
                .await?;
            println!("✓ {} removed", id);
        }

        Commands::Status => {
            let status = client.call(Method::GET, "/status", None).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Route { key } => {
            let route = client.call(Method::GET, &format!("/ring/{}", key), None).await?;
            println!("Key: {}", key);
            println!("  Partition: {}", route["partition"]);
            if let Some(owners) = route["owners"].as_array() {
                for (i, owner) in owners.iter().enumerate() {
                    let tag = if i == 0 { "owner" } else { "replica" };
                    println!(
                        "  {}: {} ({})",
                        tag,
                        owner["id"].as_str().unwrap_or_default(),
                        owner["address"].as_str().unwrap_or_default()
                    );
                }
            }
        }

        Commands::Snapshot => {
            let resp = client.call(Method::POST, "/snapshot", None).await?;
            println!("✓ snapshot at index {}", resp["index"]);
        }
    }

    Ok(())
}
