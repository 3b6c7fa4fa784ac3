//! msal-bridge - Microsoft identity bridge
//!
//! Signs in against an Entra ID / Azure AD authority, caches tokens in an
//! encrypted store and serves them to a host over line-delimited JSON.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use msal_bridge::auth::oauth::{DeviceCode, DevicePrompt};
use msal_bridge::auth::{AuthConfig, OAuthProvider};
use msal_bridge::bridge::rpc::RpcResponse;
use msal_bridge::config::Settings;
use msal_bridge::storage::EncryptedFileStore;
use msal_bridge::{BridgeFacade, TokenPayload};

#[derive(Parser)]
#[command(name = "msal-bridge")]
#[command(
    about = "Microsoft identity bridge: sign in, cache and serve access tokens",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the client registration used for sign-in
    Configure {
        /// Application (client) ID
        #[arg(long)]
        client_id: Option<String>,

        /// Authority URL, e.g. https://login.microsoftonline.com/<tenant>
        #[arg(long)]
        authority: Option<String>,

        /// Scope requested on login (repeatable; replaces saved scopes)
        #[arg(short, long = "scope")]
        scopes: Vec<String>,

        #[arg(long)]
        redirect_uri: Option<String>,

        /// Trusted authority host (repeatable; replaces saved hosts)
        #[arg(long = "known-authority")]
        known_authorities: Vec<String>,

        /// Seconds before expiry at which a token counts as expired
        #[arg(long)]
        expiration_buffer: Option<u64>,

        /// Ignore later configure calls once configured
        #[arg(long)]
        guard: Option<bool>,
    },

    /// Sign in (uses the cache or a refresh token when possible)
    Login,

    /// Sign out and clear cached tokens
    Logout,

    /// Print an access token for the given scopes
    Token {
        /// Scope to request (repeatable; defaults to the configured scopes)
        #[arg(short, long = "scope")]
        scopes: Vec<String>,
    },

    /// Show configuration and sign-in status
    Status,

    /// Serve bridge calls as line-delimited JSON on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries tokens and RPC frames
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Configure {
            client_id,
            authority,
            scopes,
            redirect_uri,
            known_authorities,
            expiration_buffer,
            guard,
        } => {
            let mut settings = Settings::load()?;
            if client_id.is_some() {
                settings.client_id = client_id;
            }
            if authority.is_some() {
                settings.authority = authority;
            }
            if redirect_uri.is_some() {
                settings.redirect_uri = redirect_uri;
            }
            if !scopes.is_empty() {
                settings.scopes = scopes;
            }
            if !known_authorities.is_empty() {
                settings.known_authorities = known_authorities;
            }
            if expiration_buffer.is_some() {
                settings.token_expiration_buffer_secs = expiration_buffer;
            }
            if let Some(guard) = guard {
                settings.guard_for_rerenders = guard;
            }
            configure(settings)?;
        }
        Commands::Login => {
            tracing::info!("Starting authentication flow...");
            let bridge = open_bridge()?;
            let token = with_cancel(&bridge, bridge.login()).await?;
            print_signed_in(&token);
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            let bridge = open_bridge()?;
            bridge.logout().await?;
            println!("Logged out successfully.");
        }
        Commands::Token { scopes } => {
            let bridge = open_bridge()?;
            let token = if scopes.is_empty() {
                with_cancel(&bridge, bridge.login()).await?
            } else {
                with_cancel(&bridge, bridge.acquire_token(scopes)).await?
            };
            println!("{}", token.access_token);
        }
        Commands::Status => {
            status()?;
        }
        Commands::Serve => {
            serve(Arc::new(open_bridge()?)).await?;
        }
    }

    Ok(())
}

fn configure(settings: Settings) -> Result<()> {
    AuthConfig::from_request(settings.to_request()).context("Invalid configuration")?;
    settings.save()?;
    println!(
        "Configuration saved to {}",
        Settings::config_path()?.display()
    );
    Ok(())
}

/// Build the bridge over the encrypted store and apply saved settings.
fn open_bridge() -> Result<BridgeFacade> {
    let settings = Settings::load()?;
    let store = Arc::new(
        EncryptedFileStore::open(Settings::data_dir()?).context("Failed to open token store")?,
    );

    let prompt: DevicePrompt = Arc::new(|code: &DeviceCode| {
        eprintln!();
        eprintln!("To sign in, visit: {}", code.verification_uri);
        eprintln!("Enter code: {}", code.user_code);
        eprintln!("(code expires in {} minutes)", code.expires_in.as_secs() / 60);
        eprintln!();
    });
    let provider = Arc::new(
        OAuthProvider::new(store.clone(), prompt).context("Failed to load refresh tokens")?,
    );
    let bridge = BridgeFacade::new(provider, store).context("Failed to open token cache")?;

    if settings.is_configured() {
        bridge.configure(settings.to_request())?;
    } else {
        tracing::debug!("No saved configuration; waiting for configure");
    }
    Ok(bridge)
}

/// Run `flow`, cancelling the interactive step on Ctrl+C.
async fn with_cancel<F>(bridge: &BridgeFacade, flow: F) -> F::Output
where
    F: std::future::Future,
{
    tokio::pin!(flow);
    tokio::select! {
        out = &mut flow => out,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            bridge.cancel();
            flow.await
        }
    }
}

fn print_signed_in(token: &TokenPayload) {
    let who = token
        .account
        .username
        .as_deref()
        .or(token.account.name.as_deref())
        .unwrap_or(&token.account.id);
    if token.from_cache {
        println!("Already signed in as {}.", who);
    } else {
        println!("Signed in as {}.", who);
    }
    println!("Token expires at {}", token.expires_at.to_rfc3339());
}

fn status() -> Result<()> {
    let settings = Settings::load()?;
    println!("Config: {}", Settings::config_path()?.display());

    if !settings.is_configured() {
        println!(
            "Not configured. Run `msal-bridge configure --client-id <id> \
             --authority <url> --scope <scope>`."
        );
        return Ok(());
    }

    println!("Client ID: {}", settings.client_id.as_deref().unwrap_or_default());
    println!("Authority: {}", settings.authority.as_deref().unwrap_or_default());
    println!("Scopes: {}", settings.scopes.join(" "));

    let bridge = open_bridge()?;
    match bridge.current_account() {
        Some(account) => {
            println!(
                "Signed in: {}",
                account.username.as_deref().unwrap_or(&account.id)
            );
            if let Some(tenant) = &account.tenant_id {
                println!("Tenant: {}", tenant);
            }
            let roles = bridge.user_roles();
            if !roles.is_empty() {
                println!("Roles: {}", roles.join(", "));
            }
        }
        None => println!("Not signed in. Run `msal-bridge login`."),
    }
    Ok(())
}

/// One request per stdin line, one response per stdout line. Requests run
/// concurrently so `cancel` can reach an in-flight `login`.
async fn serve(bridge: Arc<BridgeFacade>) -> Result<()> {
    tracing::info!("Serving bridge calls on stdin/stdout");
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_string(&response).context("Failed to encode response")?;
            line.push('\n');
            stdout
                .write_all(line.as_bytes())
                .await
                .context("Failed to write response")?;
            stdout.flush().await.context("Failed to flush stdout")?;
        }
        Ok::<(), anyhow::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let bridge = bridge.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = bridge.handle_frame(&line).await;
            let _ = tx.send(response);
        });
    }

    tracing::info!("stdin closed, draining in-flight calls");
    drop(tx);
    writer.await.context("Response writer panicked")??;
    Ok(())
}
