//! pmctl: operator CLI for the ProcessMaster Pro REST API
//!
//! # Subcommands
//! - `health`                                        : server health
//! - `login <email>`                                 : print an access token
//! - `guides [--search <text>] [--page <n>]`         : list visible guides
//! - `process <session-id>`                          : queue guide generation for a session
//! - `job <job-id> [--result]`                       : status or output of an AI job
//! - `result <session-id>`                           : outcome of a processed capture session
//! - `export <guide-id> --format html|markdown [-o]` : download a guide export
//!
//! Authenticated subcommands read the token from `--token` or `PROCESSMASTER_TOKEN`.

use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:3001";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "pmctl", version, about = "ProcessMaster Pro operator CLI")]
struct Cli {
    /// API base URL (overrides PROCESSMASTER_URL env var)
    #[arg(long, env = "PROCESSMASTER_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Bearer token for authenticated calls
    #[arg(long, env = "PROCESSMASTER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server health
    #[command(alias = "status")]
    Health,

    /// Log in with a local account and print the access token
    Login {
        email: String,

        #[arg(long, env = "PROCESSMASTER_PASSWORD", hide_env_values = true)]
        password: String,

        /// Print the full login payload as JSON
        #[arg(long)]
        json: bool,
    },

    /// List guides visible to the caller
    Guides {
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Queue guide generation for a stopped capture session
    Process { session_id: String },

    /// Inspect an AI job
    Job {
        job_id: String,

        /// Print the job output instead of its status
        #[arg(long)]
        result: bool,
    },

    /// Show the outcome of a processed capture session
    Result { session_id: String },

    /// Download a guide as html or markdown
    Export {
        guide_id: String,

        #[arg(long, default_value = "markdown")]
        format: String,

        /// Output file; defaults to guide-<id>.<format>
        #[arg(short, long)]
        output: Option<String>,
    },
}

// ============================================================================
// Envelope handling
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Extract `data` from a `{success, data | error}` body.
pub fn unwrap_envelope(body: Value) -> Result<Value, ErrorBody> {
    if body["success"].as_bool() == Some(true) {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }
    Err(serde_json::from_value(body["error"].clone()).unwrap_or(ErrorBody {
        code: "UNKNOWN".to_string(),
        message: "unexpected response".to_string(),
    }))
}

pub fn export_filename(guide_id: &str, format: &str) -> String {
    let ext = match format.to_ascii_lowercase().as_str() {
        "markdown" => "md".to_string(),
        other => other.to_string(),
    };
    format!("guide-{}.{}", guide_id, ext)
}

/// One line per guide: id, status, step count and title.
pub fn guide_row(guide: &Value) -> String {
    format!(
        "{}  {:<9}  {:>3} steps  {}",
        guide["id"].as_str().unwrap_or("?"),
        guide["status"].as_str().unwrap_or("?"),
        guide["stepCount"].as_i64().unwrap_or(0),
        guide["title"].as_str().unwrap_or(""),
    )
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    server: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> anyhow::Result<reqwest::blocking::RequestBuilder> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no token; run `pmctl login` and set PROCESSMASTER_TOKEN"))?;
        Ok(req.bearer_auth(token))
    }

    fn send(&self, req: reqwest::blocking::RequestBuilder) -> anyhow::Result<Value> {
        let resp = req.send()?;
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        unwrap_envelope(body)
            .map_err(|e| anyhow::anyhow!("server returned {} {}: {}", status.as_u16(), e.code, e.message))
    }

    fn get(&self, path: &str) -> anyhow::Result<Value> {
        let req = self.authed(self.client.get(self.url(path)))?;
        self.send(req)
    }

    fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let req = self.authed(self.client.post(self.url(path)).json(&body))?;
        self.send(req)
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn do_status(api: &Api) -> anyhow::Result<()> {
    let url = api.url("/health");
    let resp = match api.client.get(&url).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("pmctl: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    };

    let status = resp.status();
    let body: Value = resp.json().unwrap_or(Value::Null);
    match unwrap_envelope(body) {
        Ok(data) => {
            println!("ProcessMaster: {}", data["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", data["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:    {}", data["postgresql"].as_str().unwrap_or("?"));
            Ok(())
        }
        Err(e) => {
            eprintln!("pmctl: server unhealthy (HTTP {}): {}", status.as_u16(), e.message);
            std::process::exit(1);
        }
    }
}

fn do_login(api: &Api, email: &str, password: &str, json: bool) -> anyhow::Result<()> {
    let req = api
        .client
        .post(api.url("/auth/login"))
        .json(&serde_json::json!({ "email": email, "password": password }));
    let data = api.send(req)?;

    if json {
        return print_json(&data);
    }
    println!("{}", data["token"].as_str().unwrap_or_default());
    Ok(())
}

fn do_guides(api: &Api, search: Option<&str>, page: u32, limit: u32) -> anyhow::Result<()> {
    let mut path = format!("/guides?page={}&limit={}", page, limit);
    if let Some(search) = search {
        let encoded: String = url_encode(search);
        path.push_str(&format!("&search={}", encoded));
    }
    let data = api.get(&path)?;

    let guides = data["guides"].as_array().cloned().unwrap_or_default();
    if guides.is_empty() {
        eprintln!("No guides found");
        return Ok(());
    }
    for guide in &guides {
        println!("{}", guide_row(guide));
    }
    let pagination = &data["pagination"];
    println!(
        "\npage {}/{} ({} total)",
        pagination["page"].as_i64().unwrap_or(1),
        pagination["pages"].as_i64().unwrap_or(1),
        pagination["total"].as_i64().unwrap_or(0)
    );
    Ok(())
}

fn url_encode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

fn do_export(api: &Api, guide_id: &str, format: &str, output: Option<String>) -> anyhow::Result<()> {
    let url = api.url(&format!("/guides/{}/export/{}", guide_id, format));
    let resp = api.authed(api.client.get(&url))?.send()?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        let message = unwrap_envelope(body).err().map(|e| e.message).unwrap_or_default();
        anyhow::bail!("export failed (HTTP {}): {}", status.as_u16(), message);
    }

    let path = output.unwrap_or_else(|| export_filename(guide_id, format));
    let bytes = resp.bytes()?;
    std::fs::write(&path, &bytes)?;
    println!("Wrote {} bytes to {}", bytes.len(), path);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let result = Api::new(&cli.server, cli.token).and_then(|api| match cli.command {
        Commands::Health => do_status(&api),
        Commands::Login { email, password, json } => do_login(&api, &email, &password, json),
        Commands::Guides { search, page, limit } => do_guides(&api, search.as_deref(), page, limit),
        Commands::Process { session_id } => api
            .post(&format!("/capture/{}/process", session_id), Value::Null)
            .and_then(|data| print_json(&data)),
        Commands::Job { job_id, result } => {
            let view = if result { "result" } else { "status" };
            api.get(&format!("/ai/batch/{}/{}", job_id, view))
                .and_then(|data| print_json(&data))
        }
        Commands::Result { session_id } => api
            .get(&format!("/capture/{}/result", session_id))
            .and_then(|data| print_json(&data)),
        Commands::Export { guide_id, format, output } => do_export(&api, &guide_id, &format, output),
    });

    if let Err(e) = result {
        eprintln!("pmctl: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_envelope_success() {
        let data = unwrap_envelope(json!({ "success": true, "data": { "token": "abc" } })).unwrap();
        assert_eq!(data["token"], "abc");
    }

    #[test]
    fn test_unwrap_envelope_error() {
        let err = unwrap_envelope(json!({
            "success": false,
            "error": { "code": "NOT_FOUND", "message": "Guide not found" }
        }))
        .unwrap_err();
        assert_eq!(err.code, "NOT_FOUND");
        assert_eq!(err.message, "Guide not found");
    }

    #[test]
    fn test_unwrap_envelope_garbage() {
        let err = unwrap_envelope(Value::Null).unwrap_err();
        assert_eq!(err.code, "UNKNOWN");
    }

    #[test]
    fn test_export_filename() {
        assert_eq!(export_filename("42", "MD"), "guide-42.md");
        assert_eq!(export_filename("42", "markdown"), "guide-42.md");
        assert_eq!(export_filename("42", "html"), "guide-42.html");
    }

    #[test]
    fn test_guide_row_tolerates_missing_fields() {
        let row = guide_row(&json!({ "id": "g1", "title": "Onboarding" }));
        assert!(row.starts_with("g1"));
        assert!(row.contains("0 steps"));
        assert!(row.ends_with("Onboarding"));
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("reset password&x"), "reset%20password%26x");
    }
}
