//! Server-originated traffic, decoded into closed sets

use lsp_types::notification::Notification as _;
use lsp_types::request::Request as _;
use lsp_types::{
    notification, request, ApplyWorkspaceEditParams, CancelParams, ConfigurationParams,
    LogMessageParams, LogTraceParams, ProgressParams, PublishDiagnosticsParams,
    RegistrationParams, ShowDocumentParams, ShowMessageParams, ShowMessageRequestParams,
    UnregistrationParams, WorkDoneProgressCreateParams,
};
use serde_json::Value;

/// Requests a server may send to the client.
#[derive(Debug, Clone)]
pub enum ServerRequest {
    WorkspaceConfiguration(ConfigurationParams),
    WorkspaceFolders,
    ApplyEdit(ApplyWorkspaceEditParams),
    RegisterCapability(RegistrationParams),
    UnregisterCapability(UnregistrationParams),
    CodeLensRefresh,
    SemanticTokensRefresh,
    ShowMessageRequest(ShowMessageRequestParams),
    ShowDocument(ShowDocumentParams),
    WorkDoneProgressCreate(WorkDoneProgressCreateParams),
}

impl ServerRequest {
    /// `Ok(None)` for methods outside the supported set.
    pub fn parse(method: &str, params: Value) -> Result<Option<Self>, serde_json::Error> {
        let request = match method {
            request::WorkspaceConfiguration::METHOD => {
                Self::WorkspaceConfiguration(serde_json::from_value(params)?)
            }
            request::WorkspaceFoldersRequest::METHOD => Self::WorkspaceFolders,
            request::ApplyWorkspaceEdit::METHOD => Self::ApplyEdit(serde_json::from_value(params)?),
            request::RegisterCapability::METHOD => {
                Self::RegisterCapability(serde_json::from_value(params)?)
            }
            request::UnregisterCapability::METHOD => {
                Self::UnregisterCapability(serde_json::from_value(params)?)
            }
            request::CodeLensRefresh::METHOD => Self::CodeLensRefresh,
            request::SemanticTokensRefresh::METHOD => Self::SemanticTokensRefresh,
            request::ShowMessageRequest::METHOD => {
                Self::ShowMessageRequest(serde_json::from_value(params)?)
            }
            request::ShowDocument::METHOD => Self::ShowDocument(serde_json::from_value(params)?),
            request::WorkDoneProgressCreate::METHOD => {
                Self::WorkDoneProgressCreate(serde_json::from_value(params)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::WorkspaceConfiguration(_) => request::WorkspaceConfiguration::METHOD,
            Self::WorkspaceFolders => request::WorkspaceFoldersRequest::METHOD,
            Self::ApplyEdit(_) => request::ApplyWorkspaceEdit::METHOD,
            Self::RegisterCapability(_) => request::RegisterCapability::METHOD,
            Self::UnregisterCapability(_) => request::UnregisterCapability::METHOD,
            Self::CodeLensRefresh => request::CodeLensRefresh::METHOD,
            Self::SemanticTokensRefresh => request::SemanticTokensRefresh::METHOD,
            Self::ShowMessageRequest(_) => request::ShowMessageRequest::METHOD,
            Self::ShowDocument(_) => request::ShowDocument::METHOD,
            Self::WorkDoneProgressCreate(_) => request::WorkDoneProgressCreate::METHOD,
        }
    }
}

/// One-way notifications a server may send.
#[derive(Debug, Clone)]
pub enum ServerNotification {
    LogMessage(LogMessageParams),
    ShowMessage(ShowMessageParams),
    PublishDiagnostics(PublishDiagnosticsParams),
    /// Payload shape is server defined
    Telemetry(Value),
    Cancel(CancelParams),
    Progress(ProgressParams),
    LogTrace(LogTraceParams),
}

impl ServerNotification {
    /// `Ok(None)` for methods outside the supported set.
    pub fn parse(method: &str, params: Value) -> Result<Option<Self>, serde_json::Error> {
        let notification = match method {
            notification::LogMessage::METHOD => Self::LogMessage(serde_json::from_value(params)?),
            notification::ShowMessage::METHOD => Self::ShowMessage(serde_json::from_value(params)?),
            notification::PublishDiagnostics::METHOD => {
                Self::PublishDiagnostics(serde_json::from_value(params)?)
            }
            notification::TelemetryEvent::METHOD => Self::Telemetry(params),
            notification::Cancel::METHOD => Self::Cancel(serde_json::from_value(params)?),
            notification::Progress::METHOD => Self::Progress(serde_json::from_value(params)?),
            notification::LogTrace::METHOD => Self::LogTrace(serde_json::from_value(params)?),
            _ => return Ok(None),
        };
        Ok(Some(notification))
    }
}
