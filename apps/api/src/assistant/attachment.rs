//! Attachment ingestion: fetch by URL, classify, and turn into something a
//! model can read. Every failure here is recoverable; the caller logs it and
//! carries on as if nothing was attached.
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;

use crate::llm_client::ImagePart;
use crate::models::conversation::AttachmentDescriptor;

/// Extracted document text beyond this many characters is dropped.
pub const MAX_DOCUMENT_CHARS: usize = 60_000;

/// Attachments larger than this are refused before they are fully read.
pub const MAX_ATTACHMENT_BYTES: usize = 20 * 1024 * 1024;

const IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];
const TEXT_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/csv",
    "application/xml",
    "application/x-yaml",
];

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("invalid attachment url '{0}'")]
    InvalidUrl(String),

    #[error("attachment fetch failed: {0}")]
    Fetch(String),

    #[error("attachment fetch returned status {0}")]
    Status(u16),

    #[error("attachment exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("unsupported attachment type '{0}'")]
    Unsupported(String),

    #[error("text extraction failed: {0}")]
    Extraction(String),
}

/// Raw bytes plus whatever content type the storage reported.
#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, AttachmentError>;
}

/// Readable form of an attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentContent {
    Image(ImagePart),
    Document { text: String, truncated: bool },
}

impl AttachmentContent {
    pub fn kind(&self) -> &'static str {
        match self {
            AttachmentContent::Image(_) => "image",
            AttachmentContent::Document { .. } => "document",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Pdf,
    Image,
    Text,
}

/// `http(s)://` through reqwest, `s3://bucket/key` through the S3 client.
#[derive(Clone)]
pub struct RemoteAttachments {
    http: reqwest::Client,
    s3: Option<aws_sdk_s3::Client>,
    max_bytes: usize,
}

impl RemoteAttachments {
    pub fn new(http: reqwest::Client, s3: Option<aws_sdk_s3::Client>) -> Self {
        Self {
            http,
            s3,
            max_bytes: MAX_ATTACHMENT_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Refuses early when the storage announces an oversize body.
    fn check_declared(&self, length: Option<u64>) -> Result<(), AttachmentError> {
        match length {
            Some(n) if n > self.max_bytes as u64 => Err(AttachmentError::TooLarge {
                limit: self.max_bytes,
            }),
            _ => Ok(()),
        }
    }

    async fn fetch_http(&self, url: &str) -> Result<FetchedAttachment, AttachmentError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AttachmentError::Fetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttachmentError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.check_declared(response.content_length())?;

        let mut body = BytesMut::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| AttachmentError::Fetch(e.to_string()))?;
            append_capped(&mut body, &chunk, self.max_bytes)?;
        }
        Ok(FetchedAttachment {
            bytes: body.freeze(),
            content_type,
        })
    }

    async fn fetch_s3(&self, location: &str) -> Result<FetchedAttachment, AttachmentError> {
        let s3 = self
            .s3
            .as_ref()
            .ok_or_else(|| AttachmentError::Fetch("object storage is not configured".into()))?;
        let (bucket, key) = location
            .split_once('/')
            .filter(|(b, k)| !b.is_empty() && !k.is_empty())
            .ok_or_else(|| AttachmentError::InvalidUrl(format!("s3://{location}")))?;

        let object = s3
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AttachmentError::Fetch(e.to_string()))?;
        let content_type = object.content_type().map(str::to_string);
        self.check_declared(object.content_length().and_then(|n| u64::try_from(n).ok()))?;

        let mut body = BytesMut::new();
        let mut stream = object.body;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AttachmentError::Fetch(e.to_string()))?;
            append_capped(&mut body, &chunk, self.max_bytes)?;
        }
        Ok(FetchedAttachment {
            bytes: body.freeze(),
            content_type,
        })
    }
}

/// Bodies without a trustworthy length are cut off as soon as they pass the limit.
fn append_capped(buf: &mut BytesMut, chunk: &[u8], limit: usize) -> Result<(), AttachmentError> {
    if buf.len() + chunk.len() > limit {
        return Err(AttachmentError::TooLarge { limit });
    }
    buf.extend_from_slice(chunk);
    Ok(())
}

#[async_trait]
impl AttachmentSource for RemoteAttachments {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, AttachmentError> {
        if let Some(location) = url.strip_prefix("s3://") {
            self.fetch_s3(location).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url).await
        } else {
            Err(AttachmentError::InvalidUrl(url.to_string()))
        }
    }
}

/// Fetches and converts one attachment.
pub async fn ingest(
    source: &dyn AttachmentSource,
    descriptor: &AttachmentDescriptor,
) -> Result<AttachmentContent, AttachmentError> {
    let fetched = source.fetch(&descriptor.url).await?;
    let (kind, mime) = classify(
        fetched.content_type.as_deref(),
        descriptor.mime_type.as_deref(),
        descriptor.name.as_deref().unwrap_or(&descriptor.url),
    )?;
    debug!(url = %descriptor.url, mime = %mime, bytes = fetched.bytes.len(), "Attachment fetched");

    match kind {
        Kind::Image => Ok(AttachmentContent::Image(ImagePart {
            media_type: mime,
            data: STANDARD.encode(&fetched.bytes),
        })),
        Kind::Text => document(String::from_utf8_lossy(&fetched.bytes).into_owned()),
        Kind::Pdf => {
            let bytes = fetched.bytes;
            // pdf-extract is CPU-bound and synchronous.
            let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
                .await
                .map_err(|e| AttachmentError::Extraction(e.to_string()))?
                .map_err(|e| AttachmentError::Extraction(e.to_string()))?;
            document(text)
        }
    }
}

fn document(text: String) -> Result<AttachmentContent, AttachmentError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AttachmentError::Extraction("no readable text".into()));
    }
    let (text, truncated) = cap_chars(text, MAX_DOCUMENT_CHARS);
    Ok(AttachmentContent::Document { text, truncated })
}

fn cap_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((cut, _)) => (text[..cut].to_string(), true),
        None => (text.to_string(), false),
    }
}

/// Storage header first; generic or missing headers fall back to the declared
/// type, then to the file extension.
fn classify(
    header: Option<&str>,
    declared: Option<&str>,
    name: &str,
) -> Result<(Kind, String), AttachmentError> {
    let candidates = [header.map(normalize), declared.map(normalize)];
    for mime in candidates.into_iter().flatten() {
        if mime == "application/octet-stream" || mime == "binary/octet-stream" {
            continue;
        }
        return match kind_of(&mime) {
            Some(kind) => Ok((kind, mime)),
            None => Err(AttachmentError::Unsupported(mime)),
        };
    }

    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match extension.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        _ => return Err(AttachmentError::Unsupported(format!("unknown (.{extension})"))),
    };
    Ok((kind_of(mime).unwrap_or(Kind::Text), mime.to_string()))
}

fn normalize(mime: &str) -> String {
    mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

fn kind_of(mime: &str) -> Option<Kind> {
    if mime == "application/pdf" {
        Some(Kind::Pdf)
    } else if IMAGE_TYPES.contains(&mime) {
        Some(Kind::Image)
    } else if mime.starts_with("text/") || TEXT_APPLICATION_TYPES.contains(&mime) {
        Some(Kind::Text)
    } else {
        None
    }
}
