//! Command dispatcher.
//!
//! Routes a decoded [`Command`] to the ledger and maps the outcome onto a
//! protocol [`Response`]. Holds no state of its own.

use thiserror::Error;
use tracing::{debug, error, info};

use crate::command::{
    Command, CommandResult, FlowOptions, PortFlow, PortPassword, PortRef, Response, StatusCode,
    VersionInfo,
};
use crate::ledger::{FlowRange, Ledger, LedgerError};
use crate::report::{self, Phase};

/// Version reported by the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised while executing a command.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Envelope was malformed or named no known command.
    #[error("Invalid command")]
    InvalidCommand(#[source] serde_json::Error),

    /// The ledger failed while serving a command.
    #[error("Query error on '{command}': {source}")]
    Query {
        command: &'static str,
        #[source]
        source: LedgerError,
    },
}

impl DispatchError {
    /// Protocol status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCommand(_) => StatusCode::InvalidCommand,
            Self::Query { .. } => StatusCode::Error,
        }
    }
}

/// Executes control commands against the ledger.
#[derive(Clone)]
pub struct Dispatcher {
    ledger: Ledger,
}

impl Dispatcher {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Parse a JSON envelope, run it, and build the response.
    pub async fn respond(&self, payload: &[u8]) -> Response {
        match self.dispatch(payload).await {
            Ok(result) => {
                debug!(?result, "Command result");
                Response::ok(result)
            }
            Err(e) => {
                error!(error = %e, "Command failed");
                let message = match &e {
                    DispatchError::InvalidCommand(_) => None,
                    DispatchError::Query { .. } => Some(e.to_string()),
                };
                Response::failure(e.status(), message)
            }
        }
    }

    /// Parse and execute a JSON envelope.
    pub async fn dispatch(&self, payload: &[u8]) -> Result<CommandResult, DispatchError> {
        let command = Command::from_json(payload).map_err(DispatchError::InvalidCommand)?;
        info!(command = command.name(), ?command, "Message received");

        let name = command.name();
        self.execute(command).await.map_err(|source| {
            report::capture(Phase::ReceiveCommand, &source);
            DispatchError::Query {
                command: name,
                source,
            }
        })
    }

    /// Execute a decoded command.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, LedgerError> {
        match command {
            Command::List => {
                let accounts = self.ledger.list_accounts().await?;
                Ok(CommandResult::List(
                    accounts
                        .into_iter()
                        .map(|a| PortPassword {
                            port: a.id,
                            password: a.password,
                        })
                        .collect(),
                ))
            }
            Command::Add { port, password } => {
                let created = self.ledger.find_or_create(port, &password).await?;
                debug!(port, created, "Account added");
                Ok(CommandResult::Add(PortRef { port }))
            }
            Command::Delete { port } => {
                let removed = self.ledger.remove_account(port).await?;
                debug!(port, removed, "Account deleted");
                Ok(CommandResult::Delete(PortRef { port }))
            }
            Command::ChangePassword { port, password } => {
                self.ledger.change_password(port, &password).await?;
                Ok(CommandResult::ChangePassword(PortPassword { port, password }))
            }
            Command::Flow { options } => self.flow(options).await.map(CommandResult::Flow),
            Command::Version => Ok(CommandResult::Version(VersionInfo {
                version: VERSION.to_string(),
            })),
        }
    }

    async fn flow(&self, options: FlowOptions) -> Result<Vec<PortFlow>, LedgerError> {
        let range = FlowRange {
            start: options.start_time.unwrap_or(0),
            end: options
                .end_time
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        };

        let summary = if options.clear {
            self.ledger.take_flows(range).await?
        } else {
            self.ledger.flow_summary(range).await?
        };

        Ok(summary
            .into_iter()
            .map(|f| PortFlow {
                port: f.account_id,
                sum_flow: f.flow,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FlowRecord;

    fn dispatcher() -> (Dispatcher, Ledger) {
        let ledger = Ledger::open_in_memory().unwrap();
        (Dispatcher::new(ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_add_twice_keeps_one_account() {
        let (dispatcher, ledger) = dispatcher();
        let add = br#"{"command":"add","port":5,"password":"h1"}"#;

        assert_eq!(
            dispatcher.dispatch(add).await.unwrap(),
            CommandResult::Add(PortRef { port: 5 })
        );
        dispatcher.dispatch(add).await.unwrap();

        let accounts = ledger.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, 5);
    }

    #[tokio::test]
    async fn test_delete_missing_account_succeeds() {
        let (dispatcher, _) = dispatcher();
        let result = dispatcher
            .dispatch(br#"{"command":"del","port":9}"#)
            .await
            .unwrap();
        assert_eq!(result, CommandResult::Delete(PortRef { port: 9 }));
    }

    #[tokio::test]
    async fn test_change_password() {
        let (dispatcher, ledger) = dispatcher();
        dispatcher
            .dispatch(br#"{"command":"add","port":5,"password":"old"}"#)
            .await
            .unwrap();

        let result = dispatcher
            .dispatch(br#"{"command":"changePassword","port":5,"password":"new"}"#)
            .await
            .unwrap();

        assert_eq!(
            result,
            CommandResult::ChangePassword(PortPassword {
                port: 5,
                password: "new".to_string()
            })
        );
        assert_eq!(ledger.list_accounts().await.unwrap()[0].password, "new");
    }

    #[tokio::test]
    async fn test_flow_with_clear() {
        let (dispatcher, ledger) = dispatcher();
        ledger.find_or_create(1, "h1").await.unwrap();
        ledger
            .insert_flows(vec![
                FlowRecord {
                    account_id: 1,
                    flow: 40,
                    created_at: 100,
                },
                FlowRecord {
                    account_id: 1,
                    flow: 2,
                    created_at: 200,
                },
            ])
            .await
            .unwrap();

        let result = dispatcher
            .dispatch(br#"{"command":"flow","options":{"clear":true}}"#)
            .await
            .unwrap();
        assert_eq!(
            result,
            CommandResult::Flow(vec![PortFlow {
                port: 1,
                sum_flow: 42
            }])
        );
        assert!(ledger.list_flows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.respond(br#"{"command":"version"}"#).await;
        assert_eq!(response.code, 0);
        assert_eq!(
            response.data,
            Some(CommandResult::Version(VersionInfo {
                version: VERSION.to_string()
            }))
        );
    }

    #[tokio::test]
    async fn test_unknown_command_is_code_1() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.respond(br#"{"command":"reboot"}"#).await;
        assert_eq!(response.code, 1);
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn test_delegate_failure_names_command() {
        let (dispatcher, _) = dispatcher();
        dispatcher
            .dispatch(br#"{"command":"add","port":1,"password":"same"}"#)
            .await
            .unwrap();

        let response = dispatcher
            .respond(br#"{"command":"add","port":2,"password":"same"}"#)
            .await;

        assert_eq!(response.code, -1);
        assert!(response.message.unwrap().contains("Query error on 'add'"));
    }
}
