//! agentwire CLI
//!
//! Talk to a cloud agent from the terminal. `login` stores the agent id and
//! refresh token, `chat` opens a text conversation and serves the demo tools.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod chat;
mod credentials;
mod local_tools;

use chat::ChatOptions;
use credentials::{CredentialStore, Credentials};

/// agentwire - a terminal client for cloud AI agents
#[derive(Parser, Debug)]
#[command(name = "agentwire")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store agent credentials
    Login {
        #[arg(long, env = "AGENTWIRE_AGENT_ID")]
        agent_id: String,

        #[arg(long, env = "AGENTWIRE_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,
    },

    /// Remove stored credentials
    Logout,

    /// Open a text conversation
    Chat(ChatArgs),
}

#[derive(clap::Args, Debug)]
struct ChatArgs {
    /// WebSocket URL; `{agent_id}` is replaced with the agent id
    #[arg(long, env = "AGENTWIRE_ENDPOINT")]
    endpoint: String,

    /// Agent id (defaults to the stored one)
    #[arg(long, env = "AGENTWIRE_AGENT_ID")]
    agent_id: Option<String>,

    /// Refresh token (defaults to the stored one)
    #[arg(long, env = "AGENTWIRE_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// OAuth token endpoint
    #[arg(long, env = "AGENTWIRE_TOKEN_URL")]
    token_url: Option<String>,

    /// OAuth client id
    #[arg(long, env = "AGENTWIRE_CLIENT_ID")]
    client_id: Option<String>,

    /// Resume an existing conversation
    #[arg(long)]
    conversation_id: Option<String>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Also print speculative agent text
    #[arg(long)]
    show_speculative: bool,

    /// Do not reconnect after the connection drops
    #[arg(long)]
    no_reconnect: bool,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Login {
            agent_id,
            refresh_token,
        } => login(agent_id, refresh_token),
        Command::Logout => logout(),
        Command::Chat(args) => chat(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn login(agent_id: String, refresh_token: String) -> Result<(), String> {
    if agent_id.is_empty() || refresh_token.is_empty() {
        return Err("agent id and refresh token must not be empty".to_string());
    }
    let store = CredentialStore::default_location()?;
    store.save(&Credentials::new(agent_id, refresh_token))?;
    println!("Credentials saved to {}", store.path().display());
    Ok(())
}

fn logout() -> Result<(), String> {
    let store = CredentialStore::default_location()?;
    if store.clear()? {
        println!("Removed {}", store.path().display());
    } else {
        println!("No stored credentials");
    }
    Ok(())
}

async fn chat(args: ChatArgs) -> Result<(), String> {
    let stored = match (&args.agent_id, &args.refresh_token) {
        (Some(_), Some(_)) => None,
        _ => CredentialStore::default_location()?.load()?,
    };
    let (agent_id, refresh_token) = resolve_credentials(args.agent_id, args.refresh_token, stored)?;

    chat::run_chat(ChatOptions {
        endpoint: args.endpoint,
        token_url: args.token_url,
        client_id: args.client_id,
        agent_id,
        refresh_token,
        conversation_id: args.conversation_id,
        json_output: matches!(args.format, OutputFormat::Json),
        show_speculative: args.show_speculative,
        reconnect: !args.no_reconnect,
    })
    .await
}

/// Flags and environment win over the stored file, field by field
fn resolve_credentials(
    agent_id: Option<String>,
    refresh_token: Option<String>,
    stored: Option<Credentials>,
) -> Result<(String, String), String> {
    let (stored_agent, stored_token) = match stored {
        Some(credentials) => (Some(credentials.agent_id), Some(credentials.refresh_token)),
        None => (None, None),
    };
    match (agent_id.or(stored_agent), refresh_token.or(stored_token)) {
        (Some(agent_id), Some(refresh_token)) => Ok((agent_id, refresh_token)),
        _ => Err("No credentials. Run `agentwire login` or pass --agent-id and --refresh-token".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_chat() {
        let cli = Cli::try_parse_from([
            "agentwire",
            "-v",
            "chat",
            "--endpoint",
            "wss://agents.example.com/{agent_id}",
            "--format",
            "json",
            "--no-reconnect",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.endpoint, "wss://agents.example.com/{agent_id}");
        assert!(matches!(args.format, OutputFormat::Json));
        assert!(args.no_reconnect);
        assert!(!args.show_speculative);
    }

    #[test]
    fn test_resolve_credentials_prefers_flags() {
        let stored = Credentials::new("stored-agent", "stored-token");
        let resolved =
            resolve_credentials(Some("flag-agent".into()), None, Some(stored)).unwrap();
        assert_eq!(resolved, ("flag-agent".to_string(), "stored-token".to_string()));
    }

    #[test]
    fn test_resolve_credentials_missing() {
        assert!(resolve_credentials(Some("agent".into()), None, None).is_err());
        assert!(resolve_credentials(None, None, None).is_err());
    }
}
