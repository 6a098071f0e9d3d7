//! Maps tool calls onto session manager operations.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use session_broker_core::SessionStorage;
use session_broker_session::SessionManager;

use crate::protocol::{ProtocolError, ToolCall, ToolRequest, ToolResponse};

/// Dispatches parsed tool calls to a [`SessionManager`].
///
/// Command and instruction tools act on the active session; the dispatcher
/// resolves it once per call and passes the id down explicitly.
pub struct ToolDispatcher<S>
where
    S: SessionStorage,
{
    manager: Arc<SessionManager<S>>,
}

impl<S> Clone for ToolDispatcher<S>
where
    S: SessionStorage,
{
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(ProtocolError::Serialize)
}

impl<S> ToolDispatcher<S>
where
    S: SessionStorage + 'static,
{
    /// Create a dispatcher over a shared manager.
    #[must_use]
    pub const fn new(manager: Arc<SessionManager<S>>) -> Self {
        Self { manager }
    }

    /// Handle one raw request line.
    pub async fn handle_line(&self, line: &str) -> ToolResponse {
        match ToolRequest::parse(line) {
            Ok(request) => self.handle(request).await,
            Err((id, e)) => {
                tracing::warn!(error = %e, "Rejected malformed request");
                ToolResponse::failure(id, &e)
            }
        }
    }

    /// Handle one parsed request.
    pub async fn handle(&self, request: ToolRequest) -> ToolResponse {
        let ToolRequest { id, call } = request;
        match self.dispatch(call).await {
            Ok(result) => ToolResponse::success(id, result),
            Err(e) => {
                tracing::debug!(kind = ?e.kind(), error = %e, "Tool call failed");
                ToolResponse::failure(id, &e)
            }
        }
    }

    /// Execute a call and return its JSON result.
    ///
    /// # Errors
    /// Returns the manager's error, or `NoActiveSession` for session tools
    /// called without an active session.
    pub async fn dispatch(&self, call: ToolCall) -> Result<Value, ProtocolError> {
        let m = &self.manager;

        match call {
            ToolCall::SessionsList => Ok(json!({ "sessions": to_json(&m.list().await?)? })),
            ToolCall::SessionCreate { name, description } => {
                Ok(json!({ "session": to_json(&m.create(&name, &description).await?)? }))
            }
            ToolCall::SessionOpen { session_id } => to_json(&m.open(&session_id).await?),
            ToolCall::SessionCurrent => {
                let session = m.current().await?;
                let failure = m.last_summary_failure(session.id).await?;
                Ok(json!({
                    "session": to_json(&session)?,
                    "last_summary_failure": to_json(&failure)?,
                }))
            }
            ToolCall::SessionClose => Ok(json!({ "closed": m.close().await })),
            ToolCall::SessionRename { old_name, new_name } => {
                Ok(json!({ "session": to_json(&m.rename(&old_name, &new_name).await?)? }))
            }
            ToolCall::SessionDelete { name } => {
                Ok(json!({ "session": to_json(&m.delete(&name).await?)? }))
            }
            ToolCall::CommandCd { directory, context } => {
                let id = m.active_id().await?;
                to_json(&m.cd(id, context, &directory).await?)
            }
            ToolCall::CommandRead { file_path, context } => {
                let id = m.active_id().await?;
                to_json(&m.read(id, context, &file_path).await?)
            }
            ToolCall::CommandWrite {
                file_path,
                content,
                create_dirs,
                context,
            } => {
                let id = m.active_id().await?;
                to_json(&m.write(id, context, &file_path, &content, create_dirs).await?)
            }
            ToolCall::CommandRun {
                command,
                timeout,
                working_directory,
                context,
            } => {
                let id = m.active_id().await?;
                let outcome = m
                    .run(id, context, &command, timeout, working_directory.as_deref())
                    .await?;
                to_json(&outcome)
            }
            ToolCall::RecordUserRequest { user_request } => {
                let id = m.active_id().await?;
                Ok(json!({ "recorded": to_json(&m.record_user_request(id, &user_request).await?)? }))
            }
            ToolCall::AddLearning { learning, context } => {
                let id = m.active_id().await?;
                Ok(json!({ "recorded": to_json(&m.add_learning(id, context, &learning).await?)? }))
            }
            ToolCall::AddInstruction { instruction } => {
                let id = m.active_id().await?;
                Ok(json!({ "instructions": m.add_instruction(id, &instruction).await? }))
            }
            ToolCall::ReplaceInstructions { instructions } => {
                let id = m.active_id().await?;
                Ok(json!({ "instructions": m.replace_instructions(id, instructions).await? }))
            }
            ToolCall::ReadInstructions => {
                let id = m.active_id().await?;
                Ok(json!({ "instructions": m.read_instructions(id).await? }))
            }
            ToolCall::SessionHistory { limit } => {
                let id = m.active_id().await?;
                to_json(&m.history(id, limit).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use session_broker_core::{Diagnostic, ErrorKind, SessionId, SessionStorage};
    use session_broker_executor::CommandExecutor;
    use session_broker_session::storage::MemoryStorage;

    use super::*;

    fn dispatcher(dir: &std::path::Path) -> ToolDispatcher<MemoryStorage> {
        let manager = SessionManager::new(Arc::new(MemoryStorage::new()), CommandExecutor::new())
            .with_start_directory(dir);
        ToolDispatcher::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn command_tools_need_an_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let response = dispatcher
            .handle_line(r#"{"id":1,"tool":"command_read","file_path":"x"}"#)
            .await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn write_then_read_through_the_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());

        let created = dispatcher
            .handle_line(r#"{"tool":"session_create","name":"demo","description":"d"}"#)
            .await;
        assert!(created.ok);

        let written = dispatcher
            .handle_line(r#"{"tool":"command_write","file_path":"notes/a.txt","content":"hi","current_task":"t"}"#)
            .await;
        assert!(written.ok, "{written:?}");

        let read = dispatcher
            .handle_line(r#"{"id":"r","tool":"command_read","file_path":"notes/a.txt"}"#)
            .await;
        assert_eq!(read.id, Some(json!("r")));
        assert_eq!(read.result.unwrap()["content"], "hi");

        let history = dispatcher.handle_line(r#"{"tool":"session_history"}"#).await;
        assert_eq!(history.result.unwrap()["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_create_reports_kind() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let line = r#"{"tool":"session_create","name":"demo"}"#;

        assert!(dispatcher.handle_line(line).await.ok);
        let again = dispatcher.handle_line(line).await;
        assert_eq!(again.error.unwrap().kind, ErrorKind::DuplicateName);
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let response = dispatcher(dir.path()).handle_line("{not json").await;
        assert!(!response.ok);
        assert_eq!(response.id, None);
        assert_eq!(response.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn current_reports_the_last_summary_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let manager = SessionManager::new(Arc::clone(&storage), CommandExecutor::new())
            .with_start_directory(dir.path());
        let dispatcher = ToolDispatcher::new(Arc::new(manager));

        let created = dispatcher
            .handle_line(r#"{"tool":"session_create","name":"demo"}"#)
            .await;
        let id: SessionId = created.result.unwrap()["session"]["id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();

        let current = dispatcher.handle_line(r#"{"tool":"session_current"}"#).await;
        assert_eq!(current.result.unwrap()["last_summary_failure"], Value::Null);

        for error in ["first", "second"] {
            let record = Diagnostic::SummaryFailed {
                timestamp: 1.0,
                error: error.into(),
                events: 1,
                token_budget: 4096,
            };
            storage.append_diagnostic(id, &record).await.unwrap();
        }

        let current = dispatcher.handle_line(r#"{"tool":"session_current"}"#).await;
        let result = current.result.unwrap();
        assert_eq!(result["session"]["name"], "demo");
        assert_eq!(result["last_summary_failure"]["type"], "summary_failed");
        assert_eq!(result["last_summary_failure"]["error"], "second");
    }
}
