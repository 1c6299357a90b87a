use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

use crate::auth::credential::CredentialStore;
use crate::notification::model::NotificationError;
use crate::notification::service::NotificationService;
use crate::notification::views::DropdownView;

// Rows shown by `list`, matching the topbar dropdown.
const LIST_LIMIT: usize = 10;

/// One operator command read from the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Refresh,
    Read(String),
    ReadAll,
    Clear(String),
    ClearAll,
    Whoami,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("`{0}` needs a notification id")]
    MissingId(&'static str),
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let id = words.next().map(str::to_string);

        let command = match (verb.to_lowercase().as_str(), id) {
            ("list" | "ls", _) => Command::List,
            ("refresh", _) => Command::Refresh,
            ("read-all", _) => Command::ReadAll,
            ("read", Some(id)) => Command::Read(id),
            ("read", None) => return Err(CommandError::MissingId("read")),
            ("clear-all", _) => Command::ClearAll,
            ("clear", Some(id)) => Command::Clear(id),
            ("clear", None) => return Err(CommandError::MissingId("clear")),
            ("whoami", _) => Command::Whoami,
            ("help" | "?", _) => Command::Help,
            (other, _) => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

pub const HELP: &str =
    "commands: list | refresh | read <id> | read-all | clear <id> | clear-all | whoami | help";

/// Run `command` against the reconciler and render the result as text.
pub async fn execute(
    service: &NotificationService,
    credentials: &CredentialStore,
    command: Command,
) -> Result<String, NotificationError> {
    match command {
        Command::List => {
            let dropdown = DropdownView::mount(service.store(), LIST_LIMIT);
            let items = dropdown.items();
            if items.is_empty() {
                return Ok("No notifications".to_string());
            }

            let mut lines: Vec<String> = items
                .iter()
                .map(|n| {
                    format!(
                        "{} {} [{}] {} ({})",
                        if n.read { " " } else { "*" },
                        n.id,
                        n.kind.as_str(),
                        n.content,
                        n.timestamp.format("%Y-%m-%d %H:%M")
                    )
                })
                .collect();
            let hidden = dropdown.hidden_count();
            if hidden > 0 {
                lines.push(format!("... and {} more", hidden));
            }
            Ok(lines.join("\n"))
        }
        Command::Refresh => {
            let count = service.refresh().await?;
            Ok(format!("Loaded {} notifications", count))
        }
        Command::Read(id) => {
            service.mark_one_read(&id).await?;
            Ok(format!("Marked {} as read", id))
        }
        Command::ReadAll => {
            service.mark_all_read().await?;
            Ok("Marked all notifications as read".to_string())
        }
        Command::Clear(id) => {
            service.clear_one(&id).await?;
            Ok(format!("Cleared {}", id))
        }
        Command::ClearAll => {
            service.clear_all().await?;
            Ok("Cleared all notifications".to_string())
        }
        Command::Whoami => {
            let credential = credentials
                .current()
                .ok_or(NotificationError::NotAuthenticated)?;
            let role = credential
                .role()
                .map(|r| r.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let expiry = credential
                .expires_at()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            Ok(format!(
                "user {} (role {}), token expires {}",
                credential.user_id(),
                role,
                expiry
            ))
        }
        Command::Help => Ok(HELP.to_string()),
    }
}

/// Read commands line by line from `input` until it closes.
pub async fn run<R>(input: R, service: &NotificationService, credentials: &CredentialStore)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read command: {}", e);
                break;
            }
        };

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("{}; {}", e, HELP);
                continue;
            }
        };

        match execute(service, credentials, command).await {
            Ok(output) => info!("{}", output),
            Err(e) => error!("Command failed: {}", e),
        }
    }
}
