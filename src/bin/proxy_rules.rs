//! CLI tool for managing forwarding rules on a running proxy
//!
//! Usage:
//!   devproxy-rules add <source> <target>
//!   devproxy-rules delete <source>
//!   devproxy-rules list [--json]
//!   devproxy-rules test <url>
//!   devproxy-rules config

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use devproxy::{ProbeReport, ProxyConfig, Rule};
use reqwest::{Client, Response};
use serde_json::{json, Value};

/// CLI tool for managing devproxy forwarding rules
#[derive(Parser, Debug)]
#[command(name = "devproxy-rules")]
#[command(author = "devproxy Contributors")]
#[command(version)]
#[command(about = "Manage forwarding rules on a running devproxy")]
struct Args {
    /// Base URL of the proxy's management API
    #[arg(long, env = "DEVPROXY_API", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Accept the proxy's self-signed certificate
    #[arg(short = 'k', long)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add or overwrite a rule
    Add {
        /// Inbound hostname (e.g., api.local)
        source: String,

        /// Upstream host[:port] (e.g., api.example.com)
        target: String,
    },

    /// Delete a rule
    Delete {
        /// Inbound hostname
        source: String,
    },

    /// List all rules
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Issue a diagnostic GET through the proxy's upstream client
    Test {
        /// Full URL to fetch
        url: String,
    },

    /// Print the current configuration
    Config,
}

/// Turn a non-2xx answer into an error carrying the proxy's message
async fn check(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        bail!("{} ({})", message, status);
    }
    if let Some(warning) = body["warning"].as_str() {
        eprintln!("warning: {}", warning);
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let base = args.api.trim_end_matches('/');

    let client = Client::builder()
        .danger_accept_invalid_certs(args.insecure)
        .build()?;

    match args.command {
        Commands::Add { source, target } => {
            let response = client
                .post(format!("{}/api/rules", base))
                .json(&json!({ "source": source, "target": target }))
                .send()
                .await
                .with_context(|| format!("cannot reach proxy at {}", base))?;
            let rule: Rule = serde_json::from_value(check(response).await?)?;

            println!("Added rule:");
            print_rule(&rule);
        }

        Commands::Delete { source } => {
            let response = client
                .delete(format!("{}/api/rules/{}", base, source))
                .send()
                .await
                .with_context(|| format!("cannot reach proxy at {}", base))?;
            let body = check(response).await?;

            if body["deleted"].as_bool().unwrap_or(false) {
                println!("Deleted rule for {}", source);
            } else {
                eprintln!("No rule found for {}", source);
                std::process::exit(1);
            }
        }

        Commands::List { json } => {
            let response = client
                .get(format!("{}/api/rules", base))
                .send()
                .await
                .with_context(|| format!("cannot reach proxy at {}", base))?;
            let rules: Vec<Rule> = serde_json::from_value(check(response).await?)?;

            if rules.is_empty() {
                println!("No rules configured");
                return Ok(());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                println!("{:<40} {:<40}", "SOURCE", "TARGET");
                println!("{}", "-".repeat(80));
                for rule in &rules {
                    println!("{:<40} {:<40}", rule.source, rule.target);
                }
                println!("\nTotal: {} rule(s)", rules.len());
            }
        }

        Commands::Test { url } => {
            let response = client
                .post(format!("{}/api/test", base))
                .json(&json!({ "url": url }))
                .send()
                .await
                .with_context(|| format!("cannot reach proxy at {}", base))?;
            let report: ProbeReport = serde_json::from_value(check(response).await?)?;

            println!("  Status:   {}", report.status);
            println!("  Latency:  {} ms", report.latency_ms);
            for (name, value) in &report.headers {
                println!("  {}: {}", name, value);
            }
            println!("\n{}", report.body_snippet);
        }

        Commands::Config => {
            let response = client
                .get(format!("{}/api/config", base))
                .send()
                .await
                .with_context(|| format!("cannot reach proxy at {}", base))?;
            let config: ProxyConfig = serde_json::from_value(check(response).await?)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn print_rule(rule: &Rule) {
    println!("  Source:  {}", rule.source);
    println!("  Target:  {}", rule.target);
}
