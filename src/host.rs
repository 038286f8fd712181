use crate::errors::{AppError, AppResult, ClientError};
use crate::models::{AddItemPayload, ListItemsRequest, RemoveItemPayload, ReplaceOrderPayload, UpdateItemPayload};
use crate::service::CollectionService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum HostRequest {
    ListCollections,
    ListItems(ListItemsRequest),
    AddItem(AddItemPayload),
    UpdateItem(UpdateItemPayload),
    RemoveItem(RemoveItemPayload),
    ReplaceOrder(ReplaceOrderPayload),
    GetSettings,
    UpdateSettings(Value),
}

impl HostRequest {
    pub fn command(&self) -> &'static str {
        match self {
            Self::ListCollections => "list_collections",
            Self::ListItems(_) => "list_items",
            Self::AddItem(_) => "add_item",
            Self::UpdateItem(_) => "update_item",
            Self::RemoveItem(_) => "remove_item",
            Self::ReplaceOrder(_) => "replace_order",
            Self::GetSettings => "get_settings",
            Self::UpdateSettings(_) => "update_settings",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClientError>,
}

impl HostResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: &AppError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ClientError::from(error)),
        }
    }
}

#[derive(Clone)]
pub struct Host {
    service: CollectionService,
}

impl Host {
    pub fn new(service: CollectionService) -> Self {
        Self { service }
    }

    pub fn into_service(self) -> CollectionService {
        self.service
    }

    pub async fn dispatch(&self, request: HostRequest) -> AppResult<Value> {
        let value = match request {
            HostRequest::ListCollections => serde_json::to_value(self.service.list_collections())?,
            HostRequest::ListItems(request) => serde_json::to_value(self.service.list_items(request).await?)?,
            HostRequest::AddItem(payload) => serde_json::to_value(self.service.add_item(payload).await?)?,
            HostRequest::UpdateItem(payload) => serde_json::to_value(self.service.update_item(payload).await?)?,
            HostRequest::RemoveItem(payload) => serde_json::to_value(self.service.remove_item(payload).await?)?,
            HostRequest::ReplaceOrder(payload) => serde_json::to_value(self.service.replace_order(payload).await?)?,
            HostRequest::GetSettings => serde_json::to_value(self.service.get_settings().await?)?,
            HostRequest::UpdateSettings(update) => serde_json::to_value(self.service.update_settings(update).await?)?,
        };
        Ok(value)
    }

    pub async fn handle_line(&self, line: &str) -> HostResponse {
        let raw: Value = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(error) => {
                let error = AppError::Validation(format!("request is not valid JSON: {}", error));
                return HostResponse::failure(Value::Null, &error);
            }
        };
        let id = raw.get("id").cloned().unwrap_or(Value::Null);

        let request = match HostRequest::deserialize(raw) {
            Ok(request) => request,
            Err(error) => {
                let error = AppError::Validation(format!("malformed request: {}", error));
                tracing::warn!(id = %id, error = %error, "rejected request");
                return HostResponse::failure(id, &error);
            }
        };

        let command = request.command();
        match self.dispatch(request).await {
            Ok(result) => {
                tracing::debug!(id = %id, command, "request handled");
                HostResponse::success(id, result)
            }
            Err(error) => {
                tracing::warn!(id = %id, command, code = error.code(), error = %error, "request failed");
                HostResponse::failure(id, &error)
            }
        }
    }
}

/// Answers one JSON request per input line until the reader is exhausted.
pub async fn serve<R, W>(host: &Host, reader: R, mut writer: W) -> AppResult<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = host.handle_line(&line).await;
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        handled += 1;
    }
    Ok(handled)
}
