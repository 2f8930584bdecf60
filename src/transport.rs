use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::multipart::Form;

use crate::attachments::Attachment;
use crate::error::TransportError;
use crate::protocol::OutboundRequest;
use crate::stream_parser::WireFormat;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Opens one streaming response from the chat backend
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Frame format of the bodies this transport returns
    fn wire_format(&self) -> WireFormat;

    async fn open(&self, request: OutboundRequest) -> Result<ByteStream, TransportError>;
}

/// Multipart-over-HTTP transport for the chat backend
pub struct HttpTransport {
    base_url: String,
    http_client: reqwest::Client,
    api_key: String,
    wire_format: WireFormat,
    audio_char_budget: usize,
}

impl HttpTransport {
    pub fn new(
        base_url: String,
        http_client: reqwest::Client,
        api_key: String,
        wire_format: WireFormat,
        audio_char_budget: usize,
    ) -> Self {
        Self {
            base_url,
            http_client,
            api_key,
            wire_format,
            audio_char_budget,
        }
    }

    fn build_form(&self, request: OutboundRequest) -> Result<Form, TransportError> {
        let mut form = Form::new()
            .text("prompt", request.prompt)
            .text("conversation_id", request.conversation_id)
            .text("context", serde_json::to_string(&request.context)?);

        for attachment in &request.attachments {
            let (name, value) = attachment_part(attachment, self.audio_char_budget)?;
            form = form.text(name, value);
        }
        Ok(form)
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn wire_format(&self) -> WireFormat {
        self.wire_format
    }

    async fn open(&self, request: OutboundRequest) -> Result<ByteStream, TransportError> {
        let url = format!("{}/v1/chat/stream", self.base_url.trim_end_matches('/'));
        let conversation_id = request.conversation_id.clone();
        let form = self.build_form(request)?;

        tracing::info!(%url, %conversation_id, "opening chat stream");

        let mut builder = self.http_client.post(&url).multipart(form);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        Ok(response
            .bytes_stream()
            .map(|item| item.map_err(|e| TransportError::Stream(e.to_string())))
            .boxed())
    }
}

/// Form field name and serialized value for one attachment
fn attachment_part(
    attachment: &Attachment,
    audio_char_budget: usize,
) -> Result<(&'static str, String), TransportError> {
    Ok(match attachment {
        Attachment::Image { value } => ("image", value.clone()),
        Attachment::Pdf { value } => ("pdf", value.clone()),
        Attachment::Audio { value } => ("audio", truncate_chars(value, audio_char_budget)),
        Attachment::Clipboard { value } => ("clipboard", value.clone()),
        Attachment::Spreadsheet { value } => ("spreadsheet", value.clone()),
        Attachment::TextFile { value } => ("text_file", value.clone()),
        Attachment::Conversation { id, value, .. } => (
            "conversation",
            serde_json::to_string(&serde_json::json!({ "id": id, "value": value }))?,
        ),
        Attachment::WindowContext { value } => ("window_context", value.clone()),
    })
}

/// Cuts `value` to at most `max_chars` characters on a char boundary
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
