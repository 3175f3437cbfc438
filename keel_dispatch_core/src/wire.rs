//! Packed body framing for batch requests.
//!
//! The body starts with a `u32` operation count, followed by one frame per
//! operation: `u32` index, `u8` kind, then the id, partition key, `if-match`,
//! `if-none-match` and payload fields, each prefixed by a `u32` length.
//! Absent fields are written with length `u32::MAX`. Integers are big endian.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::{ResultExt, Snafu};

use crate::{
    operation::{MaterializedOperation, Operation, OperationKind},
    partition::PartitionKey,
};

const ABSENT: u32 = u32::MAX;

/// Fixed per-operation framing overhead, in bytes.
pub const FRAME_OVERHEAD: usize = 4 + 1 + 5 * 4;

/// An operation decoded from a packed body.
#[derive(Debug, Clone, PartialEq)]
pub struct WireOperation {
    pub index: usize,
    pub kind: OperationKind,
    pub id: Option<String>,
    pub partition_key: PartitionKey,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub payload: Option<Bytes>,
}

#[derive(Debug, Snafu)]
pub enum WireError {
    #[snafu(display("packed body is truncated"))]
    Truncated,
    #[snafu(display("unknown operation kind {code}"))]
    UnknownKind { code: u8 },
    #[snafu(display("field is not valid utf-8"))]
    InvalidUtf8 { source: std::string::FromUtf8Error },
    #[snafu(display("invalid partition key"))]
    InvalidPartitionKey { source: serde_json::Error },
}

/// Packs materialized operations into a body, assigning indices in order.
pub(crate) fn encode_body<'a, I>(operations: I, body_size_hint: usize) -> Bytes
where
    I: ExactSizeIterator<Item = (&'a Operation, &'a MaterializedOperation)>,
{
    let count = operations.len();
    let mut buf = BytesMut::with_capacity(4 + body_size_hint + count * FRAME_OVERHEAD);
    buf.put_u32(count as u32);

    for (index, (operation, materialized)) in operations.enumerate() {
        buf.put_u32(index as u32);
        buf.put_u8(operation.kind().code());
        put_optional(&mut buf, operation.id().map(str::as_bytes));
        put_optional(&mut buf, Some(&materialized.partition_key[..]));
        put_optional(&mut buf, operation.options().if_match.as_deref().map(str::as_bytes));
        put_optional(
            &mut buf,
            operation.options().if_none_match.as_deref().map(str::as_bytes),
        );
        put_optional(&mut buf, materialized.payload.as_deref());
    }

    buf.freeze()
}

/// Decodes a packed body.
pub fn decode_body(mut body: Bytes) -> Result<Vec<WireOperation>, WireError> {
    let count = get_u32(&mut body)? as usize;
    let mut operations = Vec::with_capacity(count.min(1024));

    for _ in 0..count {
        let index = get_u32(&mut body)? as usize;
        if body.remaining() < 1 {
            return TruncatedSnafu.fail();
        }
        let code = body.get_u8();
        let kind = OperationKind::from_code(code).ok_or(WireError::UnknownKind { code })?;
        let id = get_optional(&mut body)?.map(into_string).transpose()?;
        let partition_key = get_optional(&mut body)?.ok_or(WireError::Truncated)?;
        let partition_key =
            serde_json::from_slice(&partition_key).context(InvalidPartitionKeySnafu)?;
        let if_match = get_optional(&mut body)?.map(into_string).transpose()?;
        let if_none_match = get_optional(&mut body)?.map(into_string).transpose()?;
        let payload = get_optional(&mut body)?;

        operations.push(WireOperation {
            index,
            kind,
            id,
            partition_key,
            if_match,
            if_none_match,
            payload,
        });
    }

    Ok(operations)
}

fn put_optional(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        None => buf.put_u32(ABSENT),
        Some(value) => {
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
    }
}

fn get_u32(body: &mut Bytes) -> Result<u32, WireError> {
    if body.remaining() < 4 {
        return TruncatedSnafu.fail();
    }
    Ok(body.get_u32())
}

fn get_optional(body: &mut Bytes) -> Result<Option<Bytes>, WireError> {
    let len = get_u32(body)?;
    if len == ABSENT {
        return Ok(None);
    }

    let len = len as usize;
    if body.remaining() < len {
        return TruncatedSnafu.fail();
    }
    Ok(Some(body.split_to(len)))
}

fn into_string(bytes: Bytes) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec()).context(InvalidUtf8Snafu)
}
