use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::{
    domain::{MessageId, MessageKind, User, UserId},
    protocol::{format_timestamp, SortOrder},
};
use storage::{NewMessage, Storage};

/// Seeds and inspects the message database directly. Writes made here are
/// not announced to connected clients; they see them on their next refetch.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/messages.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    UpsertUser {
        user_id: String,
        name: String,
        #[arg(long)]
        category: Option<String>,
    },
    /// Stores a message as if `sender` had written it.
    SendMessage {
        sender: String,
        receiver: String,
        content: String,
        #[arg(long)]
        sender_name: Option<String>,
    },
    ListMessages {
        participant: String,
        #[arg(long, default_value = "desc")]
        order: String,
    },
    MarkRead {
        message_id: i64,
        user_id: String,
    },
}

fn parse_order(raw: &str) -> Result<SortOrder> {
    Ok(match raw {
        "asc" => SortOrder::Ascending,
        "desc" => SortOrder::Descending,
        "unspecified" => SortOrder::Unspecified,
        other => bail!("unknown order {other:?}; expected asc, desc or unspecified"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::UpsertUser {
            user_id,
            name,
            category,
        } => {
            let mut user = User::new(user_id, name);
            user.primary_category = category;
            storage.upsert_user(&user).await?;
            println!("upserted user_id={}", user.id);
        }
        Command::SendMessage {
            sender,
            receiver,
            content,
            sender_name,
        } => {
            if content.trim().is_empty() {
                bail!("message content cannot be empty");
            }
            let message_id = storage
                .insert_message(&NewMessage {
                    sender_id: UserId::from(sender),
                    receiver_id: UserId::from(receiver),
                    content,
                    kind: MessageKind::Text,
                    sender_name,
                    sent_at: Utc::now(),
                })
                .await?;
            println!("created message_id={}", message_id.0);
        }
        Command::ListMessages { participant, order } => {
            let participant = UserId::from(participant);
            let messages = storage
                .list_messages_for_participant(&participant, parse_order(&order)?)
                .await?;
            for message in &messages {
                let read_by: Vec<&str> = message.read_by.iter().map(UserId::as_str).collect();
                println!(
                    "{} {} {} -> {} [{}] {}",
                    message.message_id.0,
                    format_timestamp(&message.sent_at),
                    message.sender_id,
                    message.receiver_id,
                    read_by.join(","),
                    message.content
                );
            }
            println!("{} message(s)", messages.len());
        }
        Command::MarkRead {
            message_id,
            user_id,
        } => {
            let message_id = MessageId(message_id);
            let user_id = UserId::from(user_id);
            let Some(message) = storage.load_message(message_id).await? else {
                bail!("message {} not found", message_id.0);
            };
            if !message.participants.contains(&user_id) {
                bail!("{user_id} is not a participant of message {}", message_id.0);
            }
            let added = storage.mark_message_read(message_id, &user_id).await?;
            println!("message_id={} read_by {user_id} (new receipt: {added})", message_id.0);
        }
    }

    Ok(())
}
