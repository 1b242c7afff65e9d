use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{
    ClientConfig, ClientEvent, Identity, MessagingClient, RoleTokens, SendOutcome,
};
use shared::domain::{ConversationId, ConversationKind, Role, UserId};
use tracing_subscriber::EnvFilter;

mod settings;

#[derive(Parser, Debug)]
#[command(about = "Tail the campus messaging feed from a terminal")]
struct Args {
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "student")]
    role: String,
    #[arg(long)]
    name: Option<String>,
    /// Overrides the api_url from console.toml / environment.
    #[arg(long)]
    api_url: Option<String>,
    /// Post one message after connecting: "<conversation-id>:<text>".
    #[arg(long)]
    send: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = settings::load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }

    let role = match args.role.as_str() {
        "admin" => Role::Admin,
        "teacher" => Role::Teacher,
        _ => Role::Student,
    };
    let identity = Identity {
        user_id: Some(UserId::new(args.user_id)),
        name: args.name.unwrap_or_else(|| "Console User".to_string()),
        role,
    };
    let tokens = RoleTokens {
        admin: settings.admin_token,
        teacher: settings.teacher_token,
        student: settings.student_token,
    };

    let client = MessagingClient::new(ClientConfig::new(settings.api_url), identity, tokens)?;
    let mut events = client.subscribe_events();

    if !client.connect().await? {
        println!("No user id available; messaging stays inert.");
        return Ok(());
    }

    let warnings = client.load_snapshot().await;
    for warning in &warnings {
        eprintln!("warning: {} slice failed to load: {}", warning.slice, warning.message);
    }

    println!("Conversations:");
    for conversation in client.conversations().await {
        let label = match conversation.kind {
            ConversationKind::Community => conversation
                .name
                .clone()
                .unwrap_or_else(|| "(unnamed community)".to_string()),
            ConversationKind::Direct => conversation
                .participants
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        };
        println!("  {}  {}", conversation.id, label);
    }
    for invitation in client.pending_invitations().await {
        println!(
            "Pending invitation {}: {} invited you to {}",
            invitation.id, invitation.sender.name, invitation.community.name
        );
    }

    if let Some(send) = args.send {
        let (conversation, text) = send
            .split_once(':')
            .ok_or_else(|| anyhow!("--send expects \"<conversation-id>:<text>\""))?;
        match client
            .send_message(&ConversationId::from(conversation), text)
            .await?
        {
            SendOutcome::Sent(message) => println!("Sent message {}", message.id),
            SendOutcome::JoinRequested(community) => {
                println!("Join request sent to {community}; awaiting approval.")
            }
            SendOutcome::JoinRequestPending(community) => {
                println!("A join request for {community} is already pending.")
            }
        }
    }

    println!("Listening for events (ctrl-c to quit)...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::MessageReceived(message)) => {
                    println!("{}: {}", message.sender.name, message.content);
                }
                Ok(ClientEvent::ConversationAdded(conversation)) => {
                    println!("New conversation {}", conversation.id);
                }
                Ok(ClientEvent::InvitationReceived(invitation)) => {
                    println!(
                        "{} invited you to join {}",
                        invitation.sender.name, invitation.community.name
                    );
                }
                Ok(ClientEvent::JoinRequestReceived(request)) => {
                    println!("{} wants to join {}", request.user.name, request.community.name);
                }
                Ok(ClientEvent::InvitationDelivered { recipient }) => {
                    println!("Invitation delivered to {recipient}");
                }
                Ok(ClientEvent::Connected) => println!("(connected)"),
                Ok(ClientEvent::Disconnected) => println!("(disconnected)"),
                Err(err) => {
                    eprintln!("event stream ended: {err}");
                    break;
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
