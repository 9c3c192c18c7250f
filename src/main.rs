use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;

use session_gate::auth::{
    claims, AuthClient, LoginRequest, RegisterRequest, SessionManager, SessionPhase,
    SqliteCredentialStore,
};
use session_gate::config::{Command, Config, LogFormat};
use session_gate::gate::RequestGate;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level.
    // Logs go to stderr so command output stays pipeable.
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    tracing::debug!(
        api = %config.api_base_url,
        auth = %config.auth_base_url,
        db = %config.db_file.display(),
        "Configuration loaded"
    );

    let store = Arc::new(SqliteCredentialStore::open(&config.db_file)?);
    let api = AuthClient::new(
        &config.auth_base_url,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;
    let manager = SessionManager::new(api, store, config.session.clone());

    let _watch = manager.subscribe(|state| {
        tracing::debug!(
            phase = ?state.phase,
            loading = state.is_loading,
            error = ?state.last_error,
            "Session changed"
        );
    });

    let restored = manager.restore().await;
    tracing::debug!(phase = ?restored.phase, "Session restored");

    match command {
        Command::Login { email } => login(&manager, email).await,
        Command::Register { email, name } => register(&manager, email, name).await,
        Command::Status => {
            status(&manager).await;
            Ok(())
        }
        Command::Token => {
            let token = manager
                .get_valid_access_token()
                .await
                .context("Not logged in (run `session-gate login`)")?;
            println!("{}", token);
            Ok(())
        }
        Command::Get { path } => {
            let gate = RequestGate::new(
                &config.api_base_url,
                manager.clone(),
                config.http_connect_timeout,
                config.http_request_timeout,
            )?;
            let body: serde_json::Value = gate.get_json(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Command::Logout => {
            if let Some(notify) = manager.logout() {
                // best effort; the local session is already gone
                let _ = tokio::time::timeout(config.http_request_timeout, notify).await;
            }
            println!("Logged out");
            Ok(())
        }
    }
}

async fn login(manager: &SessionManager, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("Email")
            .interact_text()
            .context("Failed to read email")?,
    };
    let password: String = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    let state = manager.login(LoginRequest { email, password }).await?;
    if let Some(user) = state.user {
        println!("Logged in as {}", user.email);
    }
    Ok(())
}

async fn register(
    manager: &SessionManager,
    email: Option<String>,
    name: Option<String>,
) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("Email")
            .interact_text()
            .context("Failed to read email")?,
    };
    let password: String = Password::new()
        .with_prompt("Password")
        .with_confirmation("Repeat password", "Passwords do not match")
        .interact()
        .context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let state = manager
        .register(RegisterRequest {
            email: email.clone(),
            password,
            name,
        })
        .await?;

    if state.is_authenticated {
        println!("Account created, logged in as {}", email);
    } else {
        println!("Account created, run `session-gate login` to sign in");
    }
    Ok(())
}

async fn status(manager: &SessionManager) {
    // let a renewal started by restore settle first
    if manager.phase() == SessionPhase::Refreshing {
        let _ = manager.refresh_access_token().await;
    }

    let state = manager.state();
    match (&state.user, &state.credential) {
        (Some(user), Some(credential)) if state.is_authenticated => {
            let remaining = claims::time_remaining(&credential.access_token, claims::now_ms());
            println!("Logged in as {} (id {})", user.email, user.id);
            if let Some(name) = &user.name {
                println!("Name: {}", name);
            }
            println!("Access token expires in {}s", remaining.as_secs());
        }
        _ => println!("Not logged in"),
    }
    if let Some(error) = &state.last_error {
        println!("Last error: {}", error);
    }
}
