use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Url};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Management CLI for ticket-guard", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GUARD_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store reachability, open breakers and held locks
    Status,
    /// List every circuit breaker with its counters
    Breakers,
    /// Force breakers closed (all, or one by name)
    ResetBreakers {
        #[arg(long)]
        name: Option<String>,
    },
    /// Show lock acquisition statistics
    Locks,
    /// Show the active rate limit policy
    Policy,
    /// List rate limit anomalies
    Anomalies {
        /// Look-back window in seconds
        #[arg(long, default_value_t = 3600)]
        since: u64,
    },
    /// Clear a subject's counters in one scope, e.g. `user:42 global`
    ResetLimit { subject: String, scope: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let base = Url::parse(&cli.url)?;
    let (method, url) = match &cli.command {
        Commands::Status => (Method::GET, endpoint(&base, &["admin", "status"])?),
        Commands::Breakers => (Method::GET, endpoint(&base, &["admin", "breakers"])?),
        Commands::ResetBreakers { name } => {
            let mut url = endpoint(&base, &["admin", "breakers", "reset"])?;
            if let Some(name) = name {
                url.query_pairs_mut().append_pair("name", name);
            }
            (Method::POST, url)
        }
        Commands::Locks => (Method::GET, endpoint(&base, &["admin", "locks"])?),
        Commands::Policy => (Method::GET, endpoint(&base, &["admin", "rate-limits", "policy"])?),
        Commands::Anomalies { since } => {
            let mut url = endpoint(&base, &["admin", "rate-limits", "anomalies"])?;
            url.query_pairs_mut().append_pair("since_secs", &since.to_string());
            (Method::GET, url)
        }
        Commands::ResetLimit { subject, scope } => (
            Method::DELETE,
            endpoint(&base, &["admin", "rate-limits", subject.as_str(), scope.as_str()])?,
        ),
    };

    let res = client.request(method, url).headers(headers).send().await?;
    print_response(res).await
}

/// Append percent-encoded path segments, so scopes like `route:/api` survive.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, Box<dyn std::error::Error>> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| "admin URL cannot be a base")?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
