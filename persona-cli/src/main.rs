//! persona-cli — command-line frontend for the persona chat server
//!
//! # Subcommands
//! - `ask <question> --owner <id>`        — ask through the full pipeline
//! - `ingest <text> --owner <id>`         — add a profile document
//! - `forget --owner <id> [--source <s>]` — delete an owner's records
//! - `remember <text> --owner <id>`       — store a confirmed memory
//! - `status`                             — show server health

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8088";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "persona-cli",
    version,
    about = "Persona chat server — command-line frontend"
)]
struct Cli {
    /// Persona HTTP server URL (overrides PERSONA_HTTP_URL env var)
    #[arg(long, env = "PERSONA_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ask the persona a question
    Ask {
        /// Question text
        question: String,

        /// Owner whose profile backs the persona
        #[arg(short, long)]
        owner: String,

        /// Display name for the persona (defaults to the owner id)
        #[arg(long)]
        name: Option<String>,

        /// Session id for conversation continuity
        #[arg(long, default_value = "cli")]
        session: String,

        /// Ask as the owner themselves (unlocks private memories)
        #[arg(long)]
        as_owner: bool,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Ingest a profile document
    Ingest {
        /// Document text
        text: String,

        /// Owner namespace to store under
        #[arg(short, long)]
        owner: String,

        /// Source tag (e.g. "resume", "linkedin")
        #[arg(long)]
        source: Option<String>,
    },

    /// Delete an owner's stored records
    Forget {
        /// Owner whose records to delete
        #[arg(short, long)]
        owner: String,

        /// Restrict deletion to one source tag
        #[arg(long)]
        source: Option<String>,
    },

    /// Store a confirmed memory
    Remember {
        /// Memory text
        text: String,

        /// Owner the memory belongs to
        #[arg(short, long)]
        owner: String,

        /// Short summary
        #[arg(long, default_value = "")]
        summary: String,

        /// Category (contact, preference, personal, work, ...)
        #[arg(long)]
        category: Option<String>,

        /// Importance 1-10
        #[arg(long)]
        importance: Option<i32>,
    },

    /// Show persona server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct AskResponse {
    response: String,
    expanded_query: Option<String>,
    documents_used: Option<usize>,
    #[serde(default)]
    memory_confirmation_needed: bool,
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

fn post(server: &str, route: &str, body: serde_json::Value) -> reqwest::blocking::Response {
    let url = format!("{}{}", server, route);
    let client = match http_client(60) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("persona-cli: failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let resp = match client.post(&url).json(&body).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("persona-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("persona-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }
    resp
}

#[allow(clippy::too_many_arguments)]
fn do_ask(
    server: &str,
    question: &str,
    owner: &str,
    name: Option<String>,
    session: &str,
    as_owner: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "owner_id": owner,
        "persona_name": name,
        "question": question,
        "session_id": session,
        "is_owner": as_owner,
    });

    let resp = post(server, "/ask", body);

    if json_output {
        let raw: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&raw)?);
        return Ok(());
    }

    let ask: AskResponse = resp.json()?;
    println!("{}", ask.response);
    if let Some(expanded) = ask.expanded_query {
        if expanded != question {
            eprintln!("\n(expanded: {})", expanded);
        }
    }
    if let Some(used) = ask.documents_used {
        eprintln!("(documents used: {})", used);
    }
    if ask.memory_confirmation_needed {
        eprintln!("(the server proposed saving a new memory; confirm with `remember`)");
    }

    Ok(())
}

fn do_ingest(server: &str, text: &str, owner: &str, source: Option<String>) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "owner_id": owner,
        "text": text,
        "source": source,
    });
    let resp = post(server, "/documents", body);
    let v: serde_json::Value = resp.json()?;
    println!("Stored: {}", v["id"].as_str().unwrap_or("?"));
    Ok(())
}

fn do_forget(server: &str, owner: &str, source: Option<String>) -> anyhow::Result<()> {
    let url = format!("{}/documents", server);
    let body = serde_json::json!({
        "owner_id": owner,
        "source": source,
    });

    let resp = match http_client(60)?.delete(&url).json(&body).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("persona-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("persona-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    let v: serde_json::Value = resp.json()?;
    println!("Deleted {} record(s)", v["deleted"].as_u64().unwrap_or(0));
    Ok(())
}

fn do_remember(
    server: &str,
    text: &str,
    owner: &str,
    summary: &str,
    category: Option<String>,
    importance: Option<i32>,
) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "owner_id": owner,
        "text": text,
        "summary": summary,
        "category": category,
        "importance": importance,
    });
    let resp = post(server, "/memories", body);
    let v: serde_json::Value = resp.json()?;
    println!("Remembered: {}", v["id"].as_str().unwrap_or("?"));
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = http_client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Persona server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:          {}", body["store"].as_str().unwrap_or("?"));
            println!("Credentials:    {}", body["credentials"].as_u64().unwrap_or(0));
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("persona-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("persona-cli: cannot reach {} — {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Ask {
            question,
            owner,
            name,
            session,
            as_owner,
            json,
        } => do_ask(&server, &question, &owner, name, &session, as_owner, json),
        Commands::Ingest { text, owner, source } => do_ingest(&server, &text, &owner, source),
        Commands::Forget { owner, source } => do_forget(&server, &owner, source),
        Commands::Remember {
            text,
            owner,
            summary,
            category,
            importance,
        } => do_remember(&server, &text, &owner, &summary, category, importance),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("persona-cli: {}", e);
        std::process::exit(1);
    }
}
