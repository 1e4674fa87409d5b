use async_trait::async_trait;

use super::TextExtractor;
use crate::errors::CollaboratorError;

/// Accepts UTF-8 text documents. PDFs and other binary formats must be
/// converted to text before upload.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, document: &[u8]) -> Result<String, CollaboratorError> {
        let unreadable = |why: &str| CollaboratorError::UnreadableDocument(why.to_string());

        if document.starts_with(b"%PDF-") {
            return Err(unreadable(
                "PDF documents are not supported; upload the report as plain text",
            ));
        }
        if document.contains(&0) {
            return Err(unreadable("document looks like binary data"));
        }

        let text = std::str::from_utf8(document)
            .map_err(|e| unreadable(&format!("document is not valid UTF-8 ({})", e)))?;
        let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");

        if text.trim().is_empty() {
            return Err(unreadable("document contains no text"));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn extract(bytes: &[u8]) -> Result<String, CollaboratorError> {
        PlainTextExtractor.extract(bytes).await
    }

    #[tokio::test]
    async fn test_plain_text_passes_through() {
        let text = extract(b"Glucose 130 mg/dL 70-99\r\nHDL 35 mg/dL >40").await.unwrap();
        assert_eq!(text, "Glucose 130 mg/dL 70-99\nHDL 35 mg/dL >40");
    }

    #[tokio::test]
    async fn test_bom_is_stripped() {
        let text = extract("\u{feff}TSH 2.1 mIU/L 0.4-4.0".as_bytes()).await.unwrap();
        assert!(text.starts_with("TSH"));
    }

    #[tokio::test]
    async fn test_unreadable_inputs() {
        for bytes in [
            b"%PDF-1.4 ...".as_slice(),
            b"\x00\x01\x02".as_slice(),
            b"\xff\xfe\xfa".as_slice(),
            b"  \n\t ".as_slice(),
            b"".as_slice(),
        ] {
            assert!(
                matches!(extract(bytes).await, Err(CollaboratorError::UnreadableDocument(_))),
                "{:?} should be unreadable",
                bytes
            );
        }
    }
}
