//! Payload decoration: how stored records are joined into one upload payload.

use serde::{Deserialize, Serialize};

/// Named decoration presets, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// `[a,b,c]`
    #[default]
    JsonArray,
    /// `a\nb\nc`
    NewLine,
}

impl PayloadFormat {
    pub fn decoration(&self) -> PayloadDecoration {
        match self {
            PayloadFormat::JsonArray => PayloadDecoration::json_array(),
            PayloadFormat::NewLine => PayloadDecoration::new_line(),
        }
    }
}

/// Prefix, suffix and separator wrapped around a batch of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDecoration {
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
    pub separator: Vec<u8>,
}

impl PayloadDecoration {
    pub fn json_array() -> Self {
        Self {
            prefix: b"[".to_vec(),
            suffix: b"]".to_vec(),
            separator: b",".to_vec(),
        }
    }

    pub fn new_line() -> Self {
        Self {
            prefix: Vec::new(),
            suffix: Vec::new(),
            separator: b"\n".to_vec(),
        }
    }

    /// Size of the decorated payload for the given record sizes.
    pub fn decorated_len<I>(&self, record_lens: I) -> usize
    where
        I: IntoIterator<Item = usize>,
    {
        let mut count = 0usize;
        let mut total = 0usize;
        for len in record_lens {
            count += 1;
            total += len;
        }
        self.prefix.len()
            + self.suffix.len()
            + total
            + self.separator.len() * count.saturating_sub(1)
    }

    /// Join records into one payload.
    pub fn decorate<'a, I>(&self, records: I) -> Vec<u8>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut out = self.prefix.clone();
        for (i, record) in records.into_iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(&self.separator);
            }
            out.extend_from_slice(record);
        }
        out.extend_from_slice(&self.suffix);
        out
    }
}

impl Default for PayloadDecoration {
    fn default() -> Self {
        PayloadFormat::default().decoration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_array_decoration() {
        let deco = PayloadDecoration::json_array();
        let records: Vec<&[u8]> = vec![b"{\"a\":1}", b"{\"b\":2}"];
        let payload = deco.decorate(records.iter().copied());
        assert_eq!(payload, b"[{\"a\":1},{\"b\":2}]".to_vec());
        assert_eq!(deco.decorated_len([7, 7]), payload.len());
    }

    #[test]
    fn test_new_line_decoration() {
        let deco = PayloadFormat::NewLine.decoration();
        let payload = deco.decorate([b"one".as_slice(), b"two".as_slice()]);
        assert_eq!(payload, b"one\ntwo".to_vec());
    }

    #[test]
    fn test_empty_batch_is_just_prefix_and_suffix() {
        let deco = PayloadDecoration::json_array();
        assert_eq!(deco.decorate(std::iter::empty()), b"[]".to_vec());
        assert_eq!(deco.decorated_len(std::iter::empty()), 2);
    }
}
