//! Attachment extraction: turning Slack file attachments into data-URI
//! content parts for the model.
//!
//! Downloads go through [`ChatPlatform::download_file`], which enforces the
//! expected content types. Downloaded bytes are validated again by signature
//! before they are encoded, since Slack's mimetype field is client-supplied.
//! A file that fails any check is skipped with a warning; it never fails the
//! whole reply.

use crate::assemble::ContentPart;
use crate::platform::ChatPlatform;
use crate::SlackFile;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{info, warn};

pub const SUPPORTED_IMAGE_MIME_TYPES: [&str; 4] =
    ["image/jpeg", "image/png", "image/gif", "image/webp"];

pub const PDF_CONTENT_TYPES: [&str; 2] = ["application/pdf", "binary/octet-stream"];

/// How many PDF attachments one assembled conversation may carry in total.
pub const PDF_SLOTS: usize = 5;

/// Image formats the model backends accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    /// Identify an image by its file signature.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }
}

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF-")
}

fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

/// Download the image attachments of one message and return them as
/// image-URL content parts. Files with an unsupported mimetype, a missing
/// download URL, or bytes that do not carry a supported image signature are
/// skipped.
pub async fn image_parts(platform: &dyn ChatPlatform, files: &[SlackFile]) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for file in files {
        let Some(mime_type) = file.mime_type.as_deref() else {
            continue;
        };
        if !SUPPORTED_IMAGE_MIME_TYPES.contains(&mime_type) {
            continue;
        }
        let Some(url) = file.url_private.as_deref() else {
            warn!("skipped an image file without a download URL");
            continue;
        };
        let bytes = match platform.download_file(url, &SUPPORTED_IMAGE_MIME_TYPES).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%url, %error, "skipped an image file that failed to download");
                continue;
            }
        };
        let Some(format) = ImageFormat::sniff(&bytes) else {
            info!(%url, "skipped an image with an unsupported format");
            continue;
        };
        parts.push(ContentPart::image_url(data_uri(format.mime_type(), &bytes)));
    }
    parts
}

/// Download the PDF attachments of one message, consuming at most
/// `slots_available` slots. PDFs whose bytes do not start with the `%PDF-`
/// header are skipped.
pub async fn pdf_parts(
    platform: &dyn ChatPlatform,
    files: &[SlackFile],
    slots_available: usize,
) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for file in files {
        if parts.len() >= slots_available {
            break;
        }
        if file.mime_type.as_deref() != Some("application/pdf") {
            continue;
        }
        let Some(url) = file.url_private.as_deref() else {
            warn!("skipped a PDF file without a download URL");
            continue;
        };
        let bytes = match platform.download_file(url, &PDF_CONTENT_TYPES).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%url, %error, "skipped a PDF file that failed to download");
                continue;
            }
        };
        if !is_pdf(&bytes) {
            warn!(%url, "skipped a file without a valid PDF header");
            continue;
        }
        parts.push(ContentPart::image_url(data_uri("application/pdf", &bytes)));
    }
    parts
}
