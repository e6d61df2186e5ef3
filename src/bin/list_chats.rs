//! Inventory of the chats the bot can reach, with ready-to-paste
//! `[[sources]]` entries for config.toml.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use rustforward::config::TelegramConfig;
use rustforward::platform::telegram::TelegramClient;
use rustforward::platform::{ChatClient, ChatKind, ChatSummary};

const TEXT_OUTPUT: &str = "telegram_chats.txt";
const JSON_OUTPUT: &str = "telegram_chats.json";

#[derive(Debug, Default, Serialize)]
struct Inventory {
    channels: Vec<ChatSummary>,
    groups: Vec<ChatSummary>,
    private_chats: Vec<ChatSummary>,
}

impl Inventory {
    fn from_chats(chats: Vec<ChatSummary>) -> Self {
        let mut inventory = Inventory::default();
        for chat in chats {
            match chat.kind {
                ChatKind::Channel => inventory.channels.push(chat),
                ChatKind::Group => inventory.groups.push(chat),
                ChatKind::Private => inventory.private_chats.push(chat),
            }
        }
        inventory
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    #[serde(flatten)]
    inventory: &'a Inventory,
}

fn write_entry(out: &mut String, index: usize, chat: &ChatSummary) {
    out.push_str(&format!("{}. {} (ID: {})\n", index, chat.display_name, chat.id));
    if let Some(username) = &chat.username {
        out.push_str(&format!("   Username: @{}\n", username));
    }
}

fn source_entry(chat: &ChatSummary) -> Option<String> {
    let kind = chat.kind.source_kind()?;
    Some(format!(
        "[[sources]]  # {}\nid = {}\nkind = \"{}\"\n",
        chat.display_name, chat.id, kind
    ))
}

/// Human-readable report. Extracted so it can be unit-tested.
fn render_text(inventory: &Inventory, generated_at: DateTime<Local>) -> String {
    let rule = "-".repeat(80);
    let mut out = format!(
        "TELEGRAM CHATS LIST - Generated on {}\n{}\n\n",
        generated_at.format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(80)
    );

    out.push_str(&format!("CHANNELS\n{}\n", rule));
    for (i, chat) in inventory.channels.iter().enumerate() {
        write_entry(&mut out, i + 1, chat);
        out.push_str("   Kind: broadcast\n\n");
    }

    out.push_str(&format!("\nGROUPS\n{}\n", rule));
    for (i, chat) in inventory.groups.iter().enumerate() {
        write_entry(&mut out, i + 1, chat);
        out.push_str("   Kind: group\n\n");
    }

    out.push_str(&format!("\nPRIVATE CHATS (not usable as sources)\n{}\n", rule));
    for (i, chat) in inventory.private_chats.iter().enumerate() {
        write_entry(&mut out, i + 1, chat);
        out.push('\n');
    }

    out.push_str(&format!("\nCONFIGURATION EXAMPLES\n{}\n", rule));
    out.push_str("# For config.toml:\n");
    for chat in inventory.channels.iter().chain(&inventory.groups) {
        if let Some(entry) = source_entry(chat) {
            out.push_str(&entry);
            out.push('\n');
        }
    }

    let target = inventory
        .channels
        .first()
        .or(inventory.groups.first())
        .or(inventory.private_chats.first());
    if let Some(target) = target {
        out.push_str("# Forward destination, any chat the bot may post in\n");
        out.push_str(&format!(
            "[telegram]\ntarget_chat_id = {}  # {}\n",
            target.id, target.display_name
        ));
    }
    out
}

fn render_json(inventory: &Inventory, generated_at: DateTime<Local>) -> Result<String> {
    let report = JsonReport {
        generated_at: generated_at.to_rfc3339(),
        inventory,
    };
    serde_json::to_string_pretty(&report).context("Failed to encode chat list")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let telegram = TelegramConfig::load(&config_path)?;
    let client = TelegramClient::new(&telegram.bot_token, 0);

    println!("Connecting to Telegram...");
    client.connect().await?;

    println!("Fetching chats...");
    let chats = client.list_accessible_chats().await?;
    let inventory = Inventory::from_chats(chats);

    println!(
        "Found {} channels, {} groups, and {} private chats.",
        inventory.channels.len(),
        inventory.groups.len(),
        inventory.private_chats.len()
    );

    let now = Local::now();
    std::fs::write(TEXT_OUTPUT, render_text(&inventory, now))
        .with_context(|| format!("Could not write {}", TEXT_OUTPUT))?;
    println!("Chat information saved to {}", TEXT_OUTPUT);

    std::fs::write(JSON_OUTPUT, render_json(&inventory, now)?)
        .with_context(|| format!("Could not write {}", JSON_OUTPUT))?;
    println!("Chat information saved to {} (JSON format)", JSON_OUTPUT);

    if let Some(entry) = inventory
        .channels
        .first()
        .or(inventory.groups.first())
        .and_then(source_entry)
    {
        println!("\nSample entry for config.toml:\n{}", entry);
    }
    Ok(())
}
