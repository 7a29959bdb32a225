//! # joblens — terminal client for the analytics hub
//!
//! - `joblens status` — hub health and record count.
//! - `joblens ask "<question>"` — run the natural-language assistant.
//! - `joblens logs` — list job logs with filters.
//! - `joblens metrics <FIELD>` — grouped aggregates over a progress counter.
//! - `joblens seed` — populate the hub with synthetic records.

use clap::{Parser, Subcommand};
use joblens_core::JobLog;
use serde::Deserialize;
use tabled::{Table, Tabled};

/// Terminal client for the JOBLENS analytics hub.
#[derive(Parser)]
#[command(name = "joblens", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report hub status as JSON.
    Status,

    /// Ask the assistant a free-text question about the logs.
    Ask {
        question: String,

        /// Print the raw result rows as well as the summary.
        #[arg(long)]
        raw: bool,
    },

    /// List job logs.
    Logs {
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        country: Option<String>,
        /// Start of the time range (ISO 8601).
        #[arg(long)]
        start: Option<String>,
        /// End of the time range (ISO 8601).
        #[arg(long)]
        end: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Grouped aggregate of a progress counter (e.g. TOTAL_JOBS_SENT_TO_INDEX).
    Metrics {
        field: String,
        #[arg(long, default_value = "transactionSourceName")]
        group_by: String,
        /// "average" or "sum".
        #[arg(long, default_value = "average")]
        agg: String,
        /// Report first/last delta per group instead.
        #[arg(long)]
        delta: bool,
    },

    /// Seed the hub with synthetic job logs.
    Seed {
        #[arg(long, default_value_t = 100)]
        count: usize,
    },
}

#[derive(Deserialize)]
struct LogPage {
    data: Vec<JobLog>,
    total: usize,
    page: usize,
}

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "TIMESTAMP")]
    timestamp: String,
    #[tabled(rename = "CLIENT")]
    client: String,
    #[tabled(rename = "COUNTRY")]
    country: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "IN FEED")]
    in_feed: i64,
    #[tabled(rename = "INDEXED")]
    indexed: i64,
    #[tabled(rename = "FAILED")]
    failed: i64,
}

fn main() {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async_main(cli.command));
}

async fn async_main(cmd: Commands) {
    let client = reqwest::Client::new();
    let base_url =
        std::env::var("JOBLENS_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:4000".to_string());

    match cmd {
        Commands::Status => {
            let url = format!("{}/api/status", base_url);
            match get_json(&client, &url).await {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json).unwrap()),
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Ask { question, raw } => {
            let url = format!("{}/api/chat", base_url);
            let payload = serde_json::json!({ "question": question });
            match client.post(&url).json(&payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match resp.json::<serde_json::Value>().await {
                        Ok(body) if status.is_success() => {
                            if let Some(summary) = body.get("summary").and_then(|s| s.as_str()) {
                                println!("{}", summary);
                            }
                            if raw {
                                if let Some(data) = body.get("data") {
                                    println!();
                                    println!(
                                        "{}",
                                        serde_json::to_string_pretty(data).unwrap()
                                    );
                                }
                            }
                        }
                        Ok(body) => {
                            let error = body
                                .get("error")
                                .and_then(|e| e.as_str())
                                .unwrap_or("request failed");
                            let details = body
                                .get("details")
                                .and_then(|d| d.as_str())
                                .unwrap_or("");
                            eprintln!("Error ({}): {} — {}", status, error, details);
                        }
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Logs {
            client: feed_client,
            country,
            start,
            end,
            page,
            limit,
        } => {
            let mut params = vec![format!("page={}", page), format!("limit={}", limit)];
            if let Some(c) = feed_client {
                params.push(format!("client={}", c));
            }
            if let Some(c) = country {
                params.push(format!("country={}", c));
            }
            if let Some(s) = start {
                params.push(format!("startDate={}", s));
            }
            if let Some(e) = end {
                params.push(format!("endDate={}", e));
            }
            let url = format!("{}/api/joblogs?{}", base_url, params.join("&"));

            match client.get(&url).send().await {
                Ok(resp) => match resp.json::<LogPage>().await {
                    Ok(logs) => {
                        let rows: Vec<LogRow> = logs
                            .data
                            .iter()
                            .map(|log| LogRow {
                                timestamp: log.timestamp.to_rfc3339(),
                                client: log.transaction_source_name.clone(),
                                country: log.country_code.clone(),
                                status: log.status.to_string(),
                                in_feed: log.progress.total_jobs_in_feed,
                                indexed: log.progress.total_jobs_sent_to_index,
                                failed: log.progress.total_jobs_fail_indexed,
                            })
                            .collect();
                        println!("{}", Table::new(rows));
                        println!("page {} ({} records total)", logs.page, logs.total);
                    }
                    Err(e) => eprintln!("Error: {}", e),
                },
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Metrics {
            field,
            group_by,
            agg,
            delta,
        } => {
            let endpoint = if delta { "delta" } else { "general" };
            let url = format!(
                "{}/api/metrics/{}?field={}&groupBy={}&agg={}",
                base_url, endpoint, field, group_by, agg
            );
            match get_json(&client, &url).await {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json).unwrap()),
                Err(e) => eprintln!("Error: {}", e),
            }
        }

        Commands::Seed { count } => {
            let url = format!("{}/api/seed", base_url);
            let payload = serde_json::json!({ "count": count });
            match client.post(&url).json(&payload).send().await {
                Ok(resp) => match resp.json::<serde_json::Value>().await {
                    Ok(json) => println!("{}", serde_json::to_string_pretty(&json).unwrap()),
                    Err(e) => eprintln!("Error: {}", e),
                },
                Err(e) => eprintln!("Error: {}", e),
            }
        }
    }
}

async fn get_json(
    client: &reqwest::Client,
    url: &str,
) -> Result<serde_json::Value, reqwest::Error> {
    client.get(url).send().await?.json().await
}
