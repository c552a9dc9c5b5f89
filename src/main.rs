use anyhow::{Context, Result};
use chatkeep::cli::{Cli, Commands};
use chatkeep::{storage, utils, ConversationId, ConversationManager, Role, SessionId, Settings, Turn};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::new(),
    }
    .context("Failed to load settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = storage::open(&settings.storage).await?;
    let manager = ConversationManager::open(store, settings.cache.clone()).await?;

    let result = match cli.command {
        Commands::Append {
            conversation,
            role,
            text,
            session,
            components,
        } => handle_append(&manager, conversation, role, text, session, components).await,
        Commands::History {
            conversation,
            limit,
        } => handle_history(&manager, conversation, limit).await,
        Commands::Delete { conversation } => handle_delete(&manager, conversation).await,
        Commands::List { session } => handle_list(&manager, session),
        Commands::Stats => handle_stats(&manager),
    };

    // Everything resident is written back before the process exits
    manager.flush().await?;

    result
}

async fn handle_append(
    manager: &ConversationManager,
    conversation: String,
    role: String,
    text: String,
    session: Option<String>,
    components: Option<String>,
) -> Result<()> {
    let role: Role = role.parse().map_err(anyhow::Error::msg)?;
    let mut turn = Turn::new(role, text);

    if let Some(raw) = components {
        let value = serde_json::from_str(&raw).context("--components must be valid JSON")?;
        turn = turn.with_components(value);
    }

    let id = ConversationId::from(conversation);
    let session = session.map(SessionId::from);
    manager
        .append_turn_in_session(&id, session.as_ref(), turn)
        .await?;

    let total = manager.read_history(&id, None).await?.len();
    utils::print_success(&format!("Appended {} turn to '{}' ({} turns)", role, id, total));
    Ok(())
}

async fn handle_history(
    manager: &ConversationManager,
    conversation: String,
    limit: Option<usize>,
) -> Result<()> {
    let id = ConversationId::from(conversation);
    let turns = manager.read_history(&id, limit).await?;

    utils::print_header(&format!("Conversation {}", id));
    if turns.is_empty() {
        utils::print_info("No turns recorded");
    }
    for turn in &turns {
        utils::print_turn(turn);
    }
    Ok(())
}

async fn handle_delete(manager: &ConversationManager, conversation: String) -> Result<()> {
    let id = ConversationId::from(conversation);
    manager.delete_conversation(&id).await?;
    utils::print_success(&format!("Deleted conversation '{}'", id));
    Ok(())
}

fn handle_list(manager: &ConversationManager, session: String) -> Result<()> {
    let session = SessionId::from(session);
    let conversations = manager.list_conversations(&session);

    utils::print_header(&format!("Session {}", session));
    if conversations.is_empty() {
        utils::print_info("No conversations");
    }
    for id in conversations {
        println!("  {}", id);
    }
    Ok(())
}

fn handle_stats(manager: &ConversationManager) -> Result<()> {
    let stats = manager.stats();
    utils::print_header("Cache statistics");
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => utils::print_error(&format!("Failed to render stats: {}", e)),
    }
    Ok(())
}
