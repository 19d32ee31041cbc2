//! pgoutput message decoding.
//!
//! pgoutput is the logical-decoding plugin bound to the replication slot.
//! Each WAL-data frame carries one message, discriminated by a leading tag
//! byte: `B`egin, `C`ommit, `R`elation, `I`nsert, `U`pdate, `D`elete.
//! Tuple data references its relation by OID, so `R` descriptors must be
//! cached before the first row event arrives; a descriptor re-announced
//! after DDL replaces the cached one in place.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use posduif_shared::Lsn;

use super::{WalChange, WalOp};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated message: needed {needed} more byte(s) at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("column data is not valid UTF-8")]
    BadUtf8,

    #[error("unterminated string at offset {0}")]
    UnterminatedString(usize),

    #[error("unknown tuple marker {0:#04x}")]
    UnknownTupleMarker(u8),

    #[error("unknown column kind {0:#04x}")]
    UnknownColumnKind(u8),

    #[error("no cached relation descriptor for oid {0}")]
    UnknownRelation(u32),

    #[error("tuple has {got} columns, relation {relation} has {expected}")]
    ColumnCountMismatch {
        relation: u32,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<RelationColumn>,
}

/// Stateful decoder: the relation cache lives as long as the stream.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, Relation>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one pgoutput message.
    ///
    /// `lsn` and `commit_time` come from the enclosing WAL-data frame.
    /// Returns a change for row events (`I`/`U`/`D`); transaction markers,
    /// relation announcements and unknown tags yield `None`.
    pub fn decode(
        &mut self,
        lsn: Lsn,
        commit_time: DateTime<Utc>,
        data: &[u8],
    ) -> Result<Option<WalChange>, DecodeError> {
        let mut cursor = Cursor::new(data);
        let tag = match cursor.u8() {
            Ok(tag) => tag,
            Err(_) => return Ok(None),
        };

        match tag {
            b'B' | b'C' => Ok(None),
            b'R' => {
                let relation = decode_relation(&mut cursor)?;
                // Replace in place: DDL can change a descriptor mid-stream.
                self.relations.insert(relation.id, relation);
                Ok(None)
            }
            b'I' => self.decode_insert(&mut cursor, lsn, commit_time).map(Some),
            b'U' => self.decode_update(&mut cursor, lsn, commit_time).map(Some),
            b'D' => self.decode_delete(&mut cursor, lsn, commit_time).map(Some),
            _ => {
                // Origin, Type, Truncate, logical messages: not ours.
                tracing::trace!(tag = %(tag as char), "skipping pgoutput message");
                Ok(None)
            }
        }
    }

    pub fn relation(&self, oid: u32) -> Option<&Relation> {
        self.relations.get(&oid)
    }

    fn decode_insert(
        &self,
        cursor: &mut Cursor<'_>,
        lsn: Lsn,
        commit_time: DateTime<Utc>,
    ) -> Result<WalChange, DecodeError> {
        let relation_id = cursor.u32()?;
        let relation = self
            .relations
            .get(&relation_id)
            .ok_or(DecodeError::UnknownRelation(relation_id))?;

        let marker = cursor.u8()?;
        if marker != b'N' {
            return Err(DecodeError::UnknownTupleMarker(marker));
        }
        let columns = decode_tuple(cursor, relation)?;

        Ok(WalChange {
            lsn,
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            op: WalOp::Insert,
            columns,
            old_columns: HashMap::new(),
            commit_time,
        })
    }

    fn decode_update(
        &self,
        cursor: &mut Cursor<'_>,
        lsn: Lsn,
        commit_time: DateTime<Utc>,
    ) -> Result<WalChange, DecodeError> {
        let relation_id = cursor.u32()?;
        let relation = self
            .relations
            .get(&relation_id)
            .ok_or(DecodeError::UnknownRelation(relation_id))?;

        // Optional pre-image: 'K' (key columns) or 'O' (full old tuple),
        // present only when the table's replica identity exposes one.
        let mut old_columns = HashMap::new();
        let mut marker = cursor.u8()?;
        if marker == b'K' || marker == b'O' {
            old_columns = decode_tuple(cursor, relation)?;
            marker = cursor.u8()?;
        }
        if marker != b'N' {
            return Err(DecodeError::UnknownTupleMarker(marker));
        }
        let columns = decode_tuple(cursor, relation)?;

        Ok(WalChange {
            lsn,
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            op: WalOp::Update,
            columns,
            old_columns,
            commit_time,
        })
    }

    fn decode_delete(
        &self,
        cursor: &mut Cursor<'_>,
        lsn: Lsn,
        commit_time: DateTime<Utc>,
    ) -> Result<WalChange, DecodeError> {
        let relation_id = cursor.u32()?;
        let relation = self
            .relations
            .get(&relation_id)
            .ok_or(DecodeError::UnknownRelation(relation_id))?;

        let marker = cursor.u8()?;
        if marker != b'K' && marker != b'O' {
            return Err(DecodeError::UnknownTupleMarker(marker));
        }
        let old_columns = decode_tuple(cursor, relation)?;

        Ok(WalChange {
            lsn,
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            op: WalOp::Delete,
            columns: HashMap::new(),
            old_columns,
            commit_time,
        })
    }
}

fn decode_relation(cursor: &mut Cursor<'_>) -> Result<Relation, DecodeError> {
    let id = cursor.u32()?;
    let schema = cursor.cstr()?;
    let table = cursor.cstr()?;
    let _replica_identity = cursor.u8()?;

    let ncols = cursor.u16()? as usize;
    let mut columns = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        let _flags = cursor.u8()?;
        let name = cursor.cstr()?;
        let type_oid = cursor.u32()?;
        let _type_modifier = cursor.u32()?;
        columns.push(RelationColumn { name, type_oid });
    }

    Ok(Relation {
        id,
        schema,
        table,
        columns,
    })
}

/// Decode one tuple against its relation descriptor into a column map.
///
/// Null columns and unchanged TOAST columns are absent from the map; text
/// values arrive in PostgreSQL's text output format.
fn decode_tuple(
    cursor: &mut Cursor<'_>,
    relation: &Relation,
) -> Result<HashMap<String, Value>, DecodeError> {
    let ncols = cursor.u16()? as usize;
    if ncols != relation.columns.len() {
        return Err(DecodeError::ColumnCountMismatch {
            relation: relation.id,
            expected: relation.columns.len(),
            got: ncols,
        });
    }

    let mut columns = HashMap::with_capacity(ncols);
    for descriptor in &relation.columns {
        match cursor.u8()? {
            b'n' | b'u' => {}
            b't' => {
                let len = cursor.u32()? as usize;
                let bytes = cursor.bytes(len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::BadUtf8)?;
                columns.insert(descriptor.name.clone(), Value::String(text.to_string()));
            }
            other => return Err(DecodeError::UnknownColumnKind(other)),
        }
    }

    Ok(columns)
}

/// Byte cursor with explicit truncation errors.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + len > self.data.len() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: self.pos + len - self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let nul = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedString(start))?;
        let s = std::str::from_utf8(&self.data[start..start + nul])
            .map_err(|_| DecodeError::BadUtf8)?;
        self.pos = start + nul + 1;
        Ok(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test-side encoders mirroring the wire layout.

    fn encode_relation(id: u32, schema: &str, table: &str, columns: &[&str]) -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(schema.as_bytes());
        buf.push(0);
        buf.extend_from_slice(table.as_bytes());
        buf.push(0);
        buf.push(b'd'); // replica identity
        buf.extend_from_slice(&(columns.len() as u16).to_be_bytes());
        for name in columns {
            buf.push(0); // flags
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(&25u32.to_be_bytes()); // text oid
            buf.extend_from_slice(&u32::MAX.to_be_bytes()); // typmod
        }
        buf
    }

    fn encode_tuple(values: &[Option<&str>]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
        for value in values {
            match value {
                None => buf.push(b'n'),
                Some(text) => {
                    buf.push(b't');
                    buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
                    buf.extend_from_slice(text.as_bytes());
                }
            }
        }
        buf
    }

    fn encode_insert(relation_id: u32, values: &[Option<&str>]) -> Vec<u8> {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&relation_id.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&encode_tuple(values));
        buf
    }

    fn encode_update(
        relation_id: u32,
        old: Option<(&[Option<&str>], u8)>,
        new: &[Option<&str>],
    ) -> Vec<u8> {
        let mut buf = vec![b'U'];
        buf.extend_from_slice(&relation_id.to_be_bytes());
        if let Some((values, marker)) = old {
            buf.push(marker);
            buf.extend_from_slice(&encode_tuple(values));
        }
        buf.push(b'N');
        buf.extend_from_slice(&encode_tuple(new));
        buf
    }

    fn decoder_with_messages_relation() -> PgOutputDecoder {
        let mut decoder = PgOutputDecoder::new();
        let relation = encode_relation(
            42,
            "public",
            "messages",
            &["id", "sender_id", "recipient_id", "content"],
        );
        decoder
            .decode(Lsn(1), Utc::now(), &relation)
            .expect("relation decodes");
        decoder
    }

    #[test]
    fn relation_is_cached() {
        let decoder = decoder_with_messages_relation();
        let relation = decoder.relation(42).expect("cached");
        assert_eq!(relation.schema, "public");
        assert_eq!(relation.table, "messages");
        assert_eq!(relation.columns.len(), 4);
        assert_eq!(relation.columns[3].name, "content");
    }

    #[test]
    fn relation_is_replaced_in_place() {
        let mut decoder = decoder_with_messages_relation();
        // DDL added a column; the same OID is re-announced.
        let relation = encode_relation(42, "public", "messages", &["id", "content", "extra"]);
        decoder.decode(Lsn(2), Utc::now(), &relation).unwrap();
        assert_eq!(decoder.relation(42).unwrap().columns.len(), 3);
    }

    #[test]
    fn decodes_insert() {
        let mut decoder = decoder_with_messages_relation();
        let insert = encode_insert(42, &[Some("m-1"), Some("u-a"), Some("u-b"), Some("hi")]);
        let change = decoder
            .decode(Lsn(7), Utc::now(), &insert)
            .unwrap()
            .expect("insert yields a change");

        assert_eq!(change.op, WalOp::Insert);
        assert_eq!(change.lsn, Lsn(7));
        assert_eq!(change.table, "messages");
        assert_eq!(change.column_str("content"), Some("hi"));
        assert_eq!(change.column_str("recipient_id"), Some("u-b"));
        assert!(change.old_columns.is_empty());
    }

    #[test]
    fn null_columns_are_absent() {
        let mut decoder = decoder_with_messages_relation();
        let insert = encode_insert(42, &[Some("m-1"), None, Some("u-b"), Some("hi")]);
        let change = decoder.decode(Lsn(7), Utc::now(), &insert).unwrap().unwrap();
        assert_eq!(change.column_str("sender_id"), None);
    }

    #[test]
    fn decodes_update_with_old_tuple() {
        let mut decoder = decoder_with_messages_relation();
        let update = encode_update(
            42,
            Some((
                &[Some("m-1"), Some("u-old"), Some("u-b"), Some("hi")],
                b'O',
            )),
            &[Some("m-1"), Some("u-new"), Some("u-b"), Some("hi")],
        );
        let change = decoder.decode(Lsn(9), Utc::now(), &update).unwrap().unwrap();
        assert_eq!(change.op, WalOp::Update);
        assert_eq!(change.column_str("sender_id"), Some("u-new"));
        assert_eq!(change.old_column_str("sender_id"), Some("u-old"));
    }

    #[test]
    fn decodes_update_without_old_tuple() {
        let mut decoder = decoder_with_messages_relation();
        let update = encode_update(42, None, &[Some("m-1"), Some("u-a"), Some("u-b"), Some("hi")]);
        let change = decoder.decode(Lsn(9), Utc::now(), &update).unwrap().unwrap();
        assert_eq!(change.op, WalOp::Update);
        assert!(change.old_columns.is_empty());
    }

    #[test]
    fn decodes_delete_key_tuple() {
        let mut decoder = decoder_with_messages_relation();
        let mut delete = vec![b'D'];
        delete.extend_from_slice(&42u32.to_be_bytes());
        delete.push(b'K');
        delete.extend_from_slice(&encode_tuple(&[Some("m-1"), None, None, None]));
        let change = decoder.decode(Lsn(11), Utc::now(), &delete).unwrap().unwrap();
        assert_eq!(change.op, WalOp::Delete);
        assert_eq!(change.old_column_str("id"), Some("m-1"));
        assert!(change.columns.is_empty());
    }

    #[test]
    fn begin_commit_and_unknown_tags_yield_nothing() {
        let mut decoder = decoder_with_messages_relation();
        assert!(decoder.decode(Lsn(1), Utc::now(), b"B123").unwrap().is_none());
        assert!(decoder.decode(Lsn(1), Utc::now(), b"C123").unwrap().is_none());
        assert!(decoder.decode(Lsn(1), Utc::now(), b"Z???").unwrap().is_none());
        assert!(decoder.decode(Lsn(1), Utc::now(), b"").unwrap().is_none());
    }

    #[test]
    fn insert_for_unannounced_relation_fails() {
        let mut decoder = PgOutputDecoder::new();
        let insert = encode_insert(99, &[Some("m-1")]);
        let err = decoder.decode(Lsn(1), Utc::now(), &insert).unwrap_err();
        assert_eq!(err, DecodeError::UnknownRelation(99));
    }

    #[test]
    fn truncated_tuple_fails() {
        let mut decoder = decoder_with_messages_relation();
        let insert = encode_insert(42, &[Some("m-1"), Some("u-a"), Some("u-b"), Some("hi")]);
        let err = decoder
            .decode(Lsn(1), Utc::now(), &insert[..insert.len() - 3])
            .unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn column_count_mismatch_fails() {
        let mut decoder = decoder_with_messages_relation();
        let insert = encode_insert(42, &[Some("m-1"), Some("u-a")]);
        let err = decoder.decode(Lsn(1), Utc::now(), &insert).unwrap_err();
        assert!(matches!(err, DecodeError::ColumnCountMismatch { .. }));
    }
}
