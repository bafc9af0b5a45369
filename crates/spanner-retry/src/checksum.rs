//! Running checksum over the rows a query has delivered.
//!
//! The checksum is SHA-256 over a tagged encoding of every row: the column
//! count, then for each value a one-byte type tag and a canonical encoding of
//! the payload. It is order-sensitive (rows and columns) and type-aware, so
//! `INT64 1` and `STRING "1"` hash differently, as do NULL and an empty string.
//! It detects divergence on a best-effort basis; it is not a tamper-proof MAC.

use std::fmt;

use sha2::{Digest, Sha256};
use spanner_core::{Row, Value};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_FLOAT64: u8 = 3;
const TAG_NUMERIC: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_DATE: u8 = 7;
const TAG_TIMESTAMP: u8 = 8;
const TAG_JSON: u8 = 9;
const TAG_ARRAY: u8 = 10;

/// Digest of a prefix of a result set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Incremental checksum over consumed rows.
#[derive(Clone, Default)]
pub struct RowChecksum {
    hasher: Sha256,
    rows: u64,
}

impl RowChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delivered row into the checksum.
    pub fn update(&mut self, row: &Row) {
        self.hasher.update((row.len() as u64).to_le_bytes());
        for value in row {
            hash_value(&mut self.hasher, value);
        }
        self.rows += 1;
    }

    /// Number of rows folded in so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Digest of every row folded in so far. Does not consume the state.
    pub fn digest(&self) -> Checksum {
        Checksum(self.hasher.clone().finalize().into())
    }
}

impl fmt::Debug for RowChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowChecksum")
            .field("rows", &self.rows)
            .field("digest", &self.digest())
            .finish()
    }
}

fn hash_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([TAG_NULL]),
        Value::Bool(b) => {
            hasher.update([TAG_BOOL, u8::from(*b)]);
        }
        Value::Int64(i) => {
            hasher.update([TAG_INT64]);
            hasher.update(i.to_le_bytes());
        }
        Value::Float64(f) => {
            hasher.update([TAG_FLOAT64]);
            hasher.update(f.to_bits().to_le_bytes());
        }
        Value::Numeric(s) => {
            hasher.update([TAG_NUMERIC]);
            hash_len_prefixed(hasher, s.as_bytes());
        }
        Value::String(s) => {
            hasher.update([TAG_STRING]);
            hash_len_prefixed(hasher, s.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update([TAG_BYTES]);
            hash_len_prefixed(hasher, b);
        }
        Value::Date(d) => {
            hasher.update([TAG_DATE]);
            hasher.update(d.to_le_bytes());
        }
        Value::Timestamp(ts) => {
            hasher.update([TAG_TIMESTAMP]);
            hasher.update(ts.seconds().to_le_bytes());
            hasher.update(ts.nanos().to_le_bytes());
        }
        Value::Json(j) => {
            hasher.update([TAG_JSON]);
            hash_len_prefixed(hasher, j.to_string().as_bytes());
        }
        Value::Array(items) => {
            hasher.update([TAG_ARRAY]);
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanner_core::Timestamp;

    fn row(values: Vec<Value>) -> Row {
        let names = (0..values.len()).map(|i| format!("c{i}")).collect();
        Row::new(names, values)
    }

    fn digest_of(rows: &[Row]) -> Checksum {
        let mut checksum = RowChecksum::new();
        for r in rows {
            checksum.update(r);
        }
        checksum.digest()
    }

    #[test]
    fn test_same_rows_same_digest() {
        let rows = vec![
            row(vec![Value::Int64(1), Value::from("a")]),
            row(vec![Value::Int64(2), Value::Null]),
        ];
        assert_eq!(digest_of(&rows), digest_of(&rows.clone()));
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        let a = row(vec![Value::Int64(1)]);
        let b = row(vec![Value::Int64(2)]);
        assert_ne!(
            digest_of(&[a.clone(), b.clone()]),
            digest_of(&[b.clone(), a.clone()])
        );
        let ab = row(vec![Value::Int64(1), Value::Int64(2)]);
        let ba = row(vec![Value::Int64(2), Value::Int64(1)]);
        assert_ne!(digest_of(&[ab]), digest_of(&[ba]));
    }

    #[test]
    fn test_digest_is_type_aware() {
        let int = row(vec![Value::Int64(1)]);
        let text = row(vec![Value::from("1")]);
        assert_ne!(digest_of(&[int]), digest_of(&[text]));

        let null = row(vec![Value::Null]);
        let empty = row(vec![Value::from("")]);
        assert_ne!(digest_of(&[null]), digest_of(&[empty]));

        let ts = row(vec![Value::Timestamp(Timestamp::new(1, 0))]);
        let date = row(vec![Value::Date(1)]);
        assert_ne!(digest_of(&[ts]), digest_of(&[date]));
    }

    #[test]
    fn test_row_boundaries_matter() {
        let split = [row(vec![Value::from("ab")]), row(vec![Value::from("c")])];
        let joined = [row(vec![Value::from("a")]), row(vec![Value::from("bc")])];
        assert_ne!(digest_of(&split), digest_of(&joined));

        let one_row = [row(vec![Value::Int64(1), Value::Int64(2)])];
        let two_rows = [row(vec![Value::Int64(1)]), row(vec![Value::Int64(2)])];
        assert_ne!(digest_of(&one_row), digest_of(&two_rows));
    }

    #[test]
    fn test_digest_does_not_consume_state() {
        let mut checksum = RowChecksum::new();
        checksum.update(&row(vec![Value::Int64(1)]));
        let first = checksum.digest();
        assert_eq!(first, checksum.digest());
        checksum.update(&row(vec![Value::Int64(2)]));
        assert_ne!(first, checksum.digest());
        assert_eq!(checksum.rows(), 2);
    }

    #[test]
    fn test_empty_checksum_is_stable() {
        assert_eq!(RowChecksum::new().digest(), RowChecksum::new().digest());
        assert_eq!(RowChecksum::new().rows(), 0);
    }

    #[test]
    fn test_nested_arrays() {
        let a = row(vec![Value::Array(vec![
            Value::Array(vec![Value::Int64(1)]),
            Value::Int64(2),
        ])]);
        let b = row(vec![Value::Array(vec![
            Value::Int64(1),
            Value::Array(vec![Value::Int64(2)]),
        ])]);
        assert_ne!(digest_of(&[a]), digest_of(&[b]));
    }
}
