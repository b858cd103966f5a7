//! factline-cli, operator frontend for the factline HTTP API
//!
//! # Subcommands
//! - `status`                                  : server health
//! - `resolve <name> [--kind <kind>]`          : find or create an entity
//! - `assert <subject> <predicate> <object>`   : append a fact
//! - `supersede <fact-id> <s> <p> <o>`         : replace a fact
//! - `current <entity>`                        : believed facts right now
//! - `history <entity>`                        : every fact, oldest first
//! - `as-of <entity> <at>`                     : believed facts at an instant
//! - `changes <entity> --from <t> --to <t>`    : what changed between two instants
//! - `merge <keep> <merge>`                    : fold one entity into another
//! - `episode begin <source>`                  : open an episode
//! - `episode record <id> <s> <p> <o>`         : append a fact inside an episode
//! - `episode supersede <id> <fact-id> <s> <p> <o>` : replace a fact inside an episode
//! - `episode close <id>`                      : freeze an episode
//! - `episode retract <id>`                    : withdraw every fact of an episode
//! - `episode show <id>`                       : episode details

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8766";
const CALLER_HEADER: &str = "x-caller-id";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "factline-cli", version, about = "Query and record facts in a factline server")]
struct Cli {
    /// factline HTTP server URL (overrides FACTLINE_HTTP_URL env var)
    #[arg(long, env = "FACTLINE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print raw JSON instead of the table view
    #[arg(long, global = true)]
    json: bool,

    /// Caller identity stamped on writes
    #[arg(long, env = "FACTLINE_CALLER")]
    caller: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server status
    Status,

    /// Resolve a name to an entity id, creating it if unknown
    Resolve {
        name: String,

        #[arg(long, default_value = "other")]
        kind: String,
    },

    /// Append a fact
    Assert {
        #[command(flatten)]
        fact: FactArgs,
    },

    /// Close a fact and append its replacement
    Supersede {
        old_fact_id: String,

        #[command(flatten)]
        fact: FactArgs,
    },

    /// Facts currently believed about an entity
    Current { entity: String },

    /// Full fact history of an entity, oldest first
    History { entity: String },

    /// Facts believed about an entity at an instant
    AsOf { entity: String, at: DateTime<Utc> },

    /// Facts gained and lost between two instants
    Changes {
        entity: String,

        #[arg(long)]
        from: DateTime<Utc>,

        #[arg(long)]
        to: DateTime<Utc>,
    },

    /// Merge `merge` into `keep`
    Merge { keep: String, merge: String },

    /// Record facts as one retractable episode
    Episode {
        #[command(subcommand)]
        action: EpisodeCommand,
    },
}

#[derive(Debug, Subcommand)]
enum EpisodeCommand {
    /// Open an episode
    Begin {
        source: String,

        /// When the source event happened; defaults to now on the server
        #[arg(long)]
        occurred_at: Option<DateTime<Utc>>,
    },

    /// Append a fact inside an open episode
    Record {
        episode: String,

        #[command(flatten)]
        fact: FactArgs,
    },

    /// Supersede a fact inside an open episode
    Supersede {
        episode: String,
        old_fact_id: String,

        #[command(flatten)]
        fact: FactArgs,
    },

    /// Freeze the episode's fact list
    Close { episode: String },

    /// End the validity of every fact the episode recorded
    Retract { episode: String },

    /// Show an episode
    Show { episode: String },
}

/// Fact fields shared by every write subcommand.
#[derive(Debug, Args)]
struct FactArgs {
    subject: String,
    predicate: String,
    object: String,

    #[arg(long, default_value = "person")]
    subject_kind: String,

    #[arg(long, default_value = "other")]
    object_kind: String,

    #[arg(short, long, default_value_t = 1.0)]
    confidence: f64,

    /// RFC 3339 timestamp; defaults to now on the server
    #[arg(long)]
    valid_from: Option<DateTime<Utc>>,

    #[arg(long, default_value = "cli")]
    source: String,
}

impl FactArgs {
    /// Request body in the server's `FactInput` shape.
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "subject": self.subject,
            "subject_kind": self.subject_kind,
            "predicate": self.predicate,
            "object": self.object,
            "object_kind": self.object_kind,
            "confidence": self.confidence,
            "valid_from": self.valid_from,
            "source": self.source,
        })
    }
}

// ============================================================================
// API Response Types
// ============================================================================

/// A fact row as returned by the factline HTTP API. Scored views carry
/// `effective_confidence`; raw history does not.
#[derive(Debug, Deserialize)]
pub struct FactRow {
    pub id: String,
    pub subject_raw: String,
    pub predicate: String,
    pub object_raw: String,
    pub confidence: f64,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub source: String,
    #[serde(default)]
    pub effective_confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    pub added: Vec<FactRow>,
    pub removed: Vec<FactRow>,
}

#[derive(Debug, Deserialize)]
pub struct EpisodeRow {
    pub id: String,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retracted_at: Option<DateTime<Utc>>,
    pub fact_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveResponse {
    pub entity_id: String,
    pub matched_by: String,
}

// ============================================================================
// Output Formatting
// ============================================================================

/// Short id: first 8 hex chars of the UUID.
pub fn short_id(id: &str) -> String {
    id.replace('-', "").chars().take(8).collect()
}

/// `2023-01-01..open` style validity interval.
pub fn format_interval(from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> String {
    let end = to
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "open".to_string());
    format!("{}..{}", from.format("%Y-%m-%d"), end)
}

/// One line per fact. Shows the decayed confidence when the server sent it.
pub fn format_fact(f: &FactRow) -> String {
    let confidence = match f.effective_confidence {
        Some(eff) => format!("{:.2} ({:.2})", eff, f.confidence),
        None => format!("{:.2}", f.confidence),
    };
    format!(
        "{}  {} {} {}  [{}]  {}  {}",
        short_id(&f.id),
        f.subject_raw,
        f.predicate,
        f.object_raw,
        confidence,
        format_interval(f.valid_from, f.valid_to),
        f.source
    )
}

pub fn format_changes(changes: &ChangesResponse) -> Vec<String> {
    changes
        .added
        .iter()
        .map(|f| format!("+ {}", format_fact(f)))
        .chain(changes.removed.iter().map(|f| format!("- {}", format_fact(f))))
        .collect()
}

/// `5e1f0c2d  linkedin import  2024-01-01  closed 2024-01-02  3 facts`
pub fn format_episode(e: &EpisodeRow) -> String {
    let state = match (e.retracted_at, e.closed_at) {
        (Some(at), _) => format!("retracted {}", at.format("%Y-%m-%d")),
        (None, Some(at)) => format!("closed {}", at.format("%Y-%m-%d")),
        (None, None) => "open".to_string(),
    };
    let count = match e.fact_ids.len() {
        1 => "1 fact".to_string(),
        n => format!("{} facts", n),
    };
    format!(
        "{}  {}  {}  {}  {}",
        short_id(&e.id),
        e.source,
        e.occurred_at.format("%Y-%m-%d"),
        state,
        count
    )
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Client {
    http: reqwest::blocking::Client,
    server: String,
    caller: Option<String>,
}

impl Client {
    fn new(server: &str, caller: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
            caller,
        })
    }

    fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}{}", self.server, path);
        Self::finish(&url, self.http.get(&url).send())
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}{}", self.server, path);
        let mut req = self.http.post(&url).json(body);
        if let Some(caller) = &self.caller {
            req = req.header(CALLER_HEADER, caller);
        }
        Self::finish(&url, req.send())
    }

    fn finish(
        url: &str,
        resp: reqwest::Result<reqwest::blocking::Response>,
    ) -> anyhow::Result<serde_json::Value> {
        let resp = resp.map_err(|e| anyhow::anyhow!("connection failed to {}: {}", url, e))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().unwrap_or_default();
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("no error body");
            let kind = body["kind"].as_str().unwrap_or("unknown");
            anyhow::bail!("server returned {} ({}): {}", status, kind, message);
        }
        Ok(body)
    }
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_facts(value: serde_json::Value, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&value);
    }
    let facts: Vec<FactRow> = serde_json::from_value(value)?;
    if facts.is_empty() {
        eprintln!("No facts.");
    }
    for f in &facts {
        println!("{}", format_fact(f));
    }
    Ok(())
}

fn print_fact(value: serde_json::Value, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&value);
    }
    let fact: FactRow = serde_json::from_value(value)?;
    println!("{}", format_fact(&fact));
    Ok(())
}

fn print_episode(value: serde_json::Value, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&value);
    }
    let episode: EpisodeRow = serde_json::from_value(value)?;
    println!("{}", format_episode(&episode));
    Ok(())
}

fn do_episode(client: &Client, action: EpisodeCommand, json: bool) -> anyhow::Result<()> {
    match action {
        EpisodeCommand::Begin { source, occurred_at } => print_episode(
            client.post("/episodes", &serde_json::json!({ "source": source, "occurred_at": occurred_at }))?,
            json,
        ),
        EpisodeCommand::Record { episode, fact } => {
            print_fact(client.post(&format!("/episodes/{}/facts", episode), &fact.to_json())?, json)
        }
        EpisodeCommand::Supersede { episode, old_fact_id, fact } => {
            let mut body = fact.to_json();
            body["old_fact_id"] = serde_json::Value::String(old_fact_id);
            print_fact(client.post(&format!("/episodes/{}/supersede", episode), &body)?, json)
        }
        EpisodeCommand::Close { episode } => print_episode(
            client.post(&format!("/episodes/{}/close", episode), &serde_json::json!({}))?,
            json,
        ),
        EpisodeCommand::Retract { episode } => {
            let body = client.post(&format!("/episodes/{}/retract", episode), &serde_json::json!({}))?;
            if json {
                return print_json(&body);
            }
            let retracted = body["retracted"].as_array().map(Vec::len).unwrap_or(0);
            println!("{}  retracted {} fact(s)", short_id(&episode), retracted);
            Ok(())
        }
        EpisodeCommand::Show { episode } => {
            print_episode(client.get(&format!("/episodes/{}", episode))?, json)
        }
    }
}

fn do_status(client: &Client) -> anyhow::Result<()> {
    let body = client.get("/health")?;
    println!("factline server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:         {}", body["version"].as_str().unwrap_or("?"));
    println!("Backend:         {}", body["backend"].as_str().unwrap_or("?"));
    println!("Socket:          {}", body["socket"].as_str().unwrap_or("?"));
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::new(&cli.server, cli.caller)?;
    let json = cli.json;

    match cli.command {
        Commands::Status => do_status(&client),
        Commands::Resolve { name, kind } => {
            let body = client.post("/entities/resolve", &serde_json::json!({ "name": name, "kind": kind }))?;
            if json {
                return print_json(&body);
            }
            let resolved: ResolveResponse = serde_json::from_value(body)?;
            println!("{}  ({})", resolved.entity_id, resolved.matched_by);
            Ok(())
        }
        Commands::Assert { fact } => print_fact(client.post("/facts", &fact.to_json())?, json),
        Commands::Supersede { old_fact_id, fact } => print_fact(
            client.post(&format!("/facts/{}/supersede", old_fact_id), &fact.to_json())?,
            json,
        ),
        Commands::Current { entity } => {
            print_facts(client.get(&format!("/entities/{}/current", entity))?, json)
        }
        Commands::History { entity } => {
            print_facts(client.get(&format!("/entities/{}/history", entity))?, json)
        }
        Commands::AsOf { entity, at } => print_facts(
            client.get(&format!("/entities/{}/as-of?at={}", entity, at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))?,
            json,
        ),
        Commands::Changes { entity, from, to } => {
            let body = client.get(&format!(
                "/entities/{}/changes?from={}&to={}",
                entity,
                from.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                to.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            ))?;
            if json {
                return print_json(&body);
            }
            let changes: ChangesResponse = serde_json::from_value(body)?;
            let lines = format_changes(&changes);
            if lines.is_empty() {
                eprintln!("No changes.");
            }
            for line in lines {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Merge { keep, merge } => {
            let body = client.post(
                &format!("/entities/{}/merge", keep),
                &serde_json::json!({ "merge_id": merge }),
            )?;
            if json {
                return print_json(&body);
            }
            println!(
                "{} now answers for {}",
                body["id"].as_str().unwrap_or("?"),
                body["aliases"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join(", "))
                    .unwrap_or_default()
            );
            Ok(())
        }
        Commands::Episode { action } => do_episode(&client, action, json),
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("factline-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
