use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the resilient proxy admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, env = "RESILIENT_PROXY_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check proxy status and uptime
    Status,
    /// Request totals and per-service pipeline stats
    Stats,
    /// Breaker state per service
    Breakers,
    /// Services whose breaker is not closed
    Unhealthy,
    /// Force a service's breaker closed, or every breaker with --all
    Reset {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },
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

    let (method, path) = match &cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string()),
        Commands::Stats => (Method::GET, "/admin/stats".to_string()),
        Commands::Breakers => (Method::GET, "/admin/breakers".to_string()),
        Commands::Unhealthy => (Method::GET, "/admin/unhealthy".to_string()),
        Commands::Reset { all: true, .. } => (Method::POST, "/admin/breakers/reset".to_string()),
        Commands::Reset { name: Some(name), .. } => {
            (Method::POST, format!("/admin/breakers/{}/reset", name))
        }
        Commands::Reset { name: None, .. } => {
            eprintln!("Error: give a service name or --all");
            std::process::exit(2);
        }
    };

    let url = format!("{}{}", cli.url.trim_end_matches('/'), path);
    let res = client.request(method, url).headers(headers).send().await?;
    print_response(res).await
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
