//! Versioned chunk payload encoding.
//!
//! A payload is newline-delimited JSON: one header line
//! `{"format":"chunk-sync/items","version":1}` followed by one `[key, value]`
//! array per item. Decoding is lazy; items are parsed one line at a time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

pub const PAYLOAD_FORMAT: &str = "chunk-sync/items";
pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PayloadHeader {
    format: String,
    version: u32,
}

/// Encodes items into the payload format. Returns the payload and the item count.
pub fn encode_items<I, K>(items: I) -> Result<(String, usize)>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let header = PayloadHeader {
        format: PAYLOAD_FORMAT.to_string(),
        version: PAYLOAD_VERSION,
    };
    let mut out = serde_json::to_string(&header)?;
    let mut count = 0;
    for (key, value) in items {
        out.push('\n');
        out.push_str(&serde_json::to_string(&(key.into(), value))?);
        count += 1;
    }
    Ok((out, count))
}

/// Validates the header and returns a lazy iterator over the items.
pub fn decode_items(data: &str) -> Result<ChunkItems<'_>> {
    let mut lines = data.lines();
    let header_line = lines
        .next()
        .ok_or_else(|| SyncError::Payload("empty payload".to_string()))?;
    let header: PayloadHeader = serde_json::from_str(header_line)
        .map_err(|e| SyncError::Payload(format!("invalid payload header: {e}")))?;
    if header.format != PAYLOAD_FORMAT {
        return Err(SyncError::Payload(format!(
            "unexpected payload format '{}'",
            header.format
        )));
    }
    if header.version != PAYLOAD_VERSION {
        return Err(SyncError::Payload(format!(
            "unsupported payload version {} (supported: {})",
            header.version, PAYLOAD_VERSION
        )));
    }
    Ok(ChunkItems { lines, line_no: 1 })
}

/// Lazy sequence of `(key, value)` items borrowed from an encoded payload.
pub struct ChunkItems<'a> {
    lines: std::str::Lines<'a>,
    line_no: usize,
}

impl Iterator for ChunkItems<'_> {
    type Item = Result<(String, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str::<(String, Value)>(line).map_err(|e| {
                SyncError::Payload(format!("payload line {}: {e}", self.line_no))
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encoded_items_decode_in_order() {
        let (data, count) = encode_items(vec![
            ("sku-1", json!({"price": 10})),
            ("sku-2", json!("text\nwith newline")),
        ])
        .expect("encode");
        assert_eq!(count, 2);
        assert_eq!(data.lines().count(), 3);

        let items: Vec<(String, Value)> = decode_items(&data)
            .expect("decode")
            .collect::<Result<_>>()
            .expect("items");
        assert_eq!(items[0], ("sku-1".to_string(), json!({"price": 10})));
        assert_eq!(items[1].1, json!("text\nwith newline"));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let data = r#"{"format":"chunk-sync/items","version":9}"#;
        let err = decode_items(data).err().expect("version error");
        assert!(err.to_string().contains("unsupported payload version 9"));
    }

    #[test]
    fn corrupt_line_surfaces_when_reached() {
        let data = format!(
            "{}\n[\"a\",1]\nnot-json",
            r#"{"format":"chunk-sync/items","version":1}"#
        );
        let mut items = decode_items(&data).expect("header ok");
        assert!(items.next().expect("first").is_ok());
        let err = items.next().expect("second").unwrap_err();
        assert!(err.to_string().contains("payload line 3"));
        assert!(items.next().is_none());
    }
}
