#![forbid(unsafe_code)]

use crate::model::{As4Message, COMPRESSION_TYPE_PROPERTY, MIME_TYPE_PROPERTY};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

pub const GZIP_CONTENT_TYPE: &str = "application/gzip";

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("failed to compress attachment `{content_id}`: {source}")]
    Compress {
        content_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decompress attachment `{content_id}`: {source}")]
    Decompress {
        content_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("attachment `{content_id}` uses unsupported compression `{compression}`")]
    Unsupported {
        content_id: String,
        compression: String,
    },
}

/// Gzips every attachment not yet compressed, recording the original MIME
/// type in the part properties.
pub fn compress_attachments(message: &mut As4Message) -> Result<usize, CompressionError> {
    let mut compressed = 0;
    for attachment in &mut message.attachments {
        if attachment.properties.contains_key(COMPRESSION_TYPE_PROPERTY) {
            continue;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let body = encoder
            .write_all(&attachment.content)
            .and_then(|_| encoder.finish())
            .map_err(|source| CompressionError::Compress {
                content_id: attachment.content_id.clone(),
                source,
            })?;

        attachment
            .properties
            .insert(MIME_TYPE_PROPERTY.to_string(), attachment.content_type.clone());
        attachment
            .properties
            .insert(COMPRESSION_TYPE_PROPERTY.to_string(), GZIP_CONTENT_TYPE.to_string());
        attachment.content_type = GZIP_CONTENT_TYPE.to_string();
        attachment.content = body;
        compressed += 1;
    }
    Ok(compressed)
}

/// Reverses [`compress_attachments`]. Leaves the message untouched on failure.
pub fn decompress_attachments(message: &mut As4Message) -> Result<usize, CompressionError> {
    let mut restored = Vec::new();
    for (index, attachment) in message.attachments.iter().enumerate() {
        let Some(compression) = attachment.properties.get(COMPRESSION_TYPE_PROPERTY) else {
            continue;
        };
        if !compression.eq_ignore_ascii_case(GZIP_CONTENT_TYPE) {
            return Err(CompressionError::Unsupported {
                content_id: attachment.content_id.clone(),
                compression: compression.clone(),
            });
        }
        let mut body = Vec::new();
        GzDecoder::new(attachment.content.as_slice())
            .read_to_end(&mut body)
            .map_err(|source| CompressionError::Decompress {
                content_id: attachment.content_id.clone(),
                source,
            })?;
        restored.push((index, body));
    }

    let count = restored.len();
    for (index, body) in restored {
        let attachment = &mut message.attachments[index];
        attachment.properties.remove(COMPRESSION_TYPE_PROPERTY);
        if let Some(mime) = attachment.properties.remove(MIME_TYPE_PROPERTY) {
            attachment.content_type = mime;
        }
        attachment.content = body;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attachment;

    fn message(content: &[u8]) -> As4Message {
        As4Message::default().with_attachments(vec![Attachment {
            content_id: "p-1".into(),
            content_type: "application/xml".into(),
            content: content.to_vec(),
            properties: Default::default(),
        }])
    }

    #[test]
    fn restores_content_and_mime_type() {
        let mut msg = message(b"<order id='1'/>");
        assert_eq!(compress_attachments(&mut msg).unwrap(), 1);
        assert!(msg.is_compressed());
        assert_eq!(msg.attachments[0].content_type, GZIP_CONTENT_TYPE);
        assert_eq!(compress_attachments(&mut msg).unwrap(), 0);

        assert_eq!(decompress_attachments(&mut msg).unwrap(), 1);
        assert_eq!(msg.attachments[0].content, b"<order id='1'/>".to_vec());
        assert_eq!(msg.attachments[0].content_type, "application/xml");
        assert!(msg.attachments[0].properties.is_empty());
    }

    #[test]
    fn corrupt_body_is_reported_and_left_alone() {
        let mut msg = message(b"not gzip at all");
        msg.attachments[0]
            .properties
            .insert(COMPRESSION_TYPE_PROPERTY.into(), GZIP_CONTENT_TYPE.into());
        let err = decompress_attachments(&mut msg).unwrap_err();
        assert!(matches!(err, CompressionError::Decompress { .. }));
        assert_eq!(msg.attachments[0].content, b"not gzip at all".to_vec());
    }
}
