//! Packing operations into size and count bounded batches.
use bytes::Bytes;

use crate::{error::DispatchError, operation::Operation, wire};

/// An ordered list of operations and their packed body.
///
/// The position of an operation in the batch is its batch-local index.
#[derive(Debug)]
pub struct Batch<T> {
    operations: Vec<T>,
    body: Bytes,
    approximate_size: usize,
}

/// The outcome of a [`pack`] call.
#[derive(Debug)]
pub struct PackResult<T> {
    /// The accepted prefix.
    pub batch: Batch<T>,
    /// The operations that did not fit, in their original order.
    pub overflow: Vec<T>,
    /// Operations that failed to materialize.
    pub rejected: Vec<(T, DispatchError)>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[T] {
        &self.operations
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Sum of the approximate sizes of the operations.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    pub fn into_parts(self) -> (Vec<T>, Bytes) {
        (self.operations, self.body)
    }
}

/// Packs the longest prefix of `operations` that fits the bounds.
///
/// Packing stops at the first operation that would exceed either bound, and
/// that operation and everything after it goes to the overflow. An operation
/// larger than `max_body_bytes` is accepted on its own when nothing else has
/// been accepted, so the caller always makes progress.
pub fn pack<T, I>(operations: I, max_body_bytes: usize, max_operation_count: usize) -> PackResult<T>
where
    T: AsRef<Operation>,
    I: IntoIterator<Item = T>,
{
    let max_operation_count = max_operation_count.max(1);

    let mut accepted = Vec::new();
    let mut overflow = Vec::new();
    let mut rejected = Vec::new();
    let mut approximate_size = 0;

    let mut operations = operations.into_iter();
    for operation in operations.by_ref() {
        let size = match operation.as_ref().approximate_size() {
            Ok(size) => size,
            Err(error) => {
                rejected.push((operation, error));
                continue;
            }
        };

        let over_count = accepted.len() >= max_operation_count;
        let over_size = !accepted.is_empty() && approximate_size + size > max_body_bytes;
        if over_count || over_size {
            overflow.push(operation);
            break;
        }

        approximate_size += size;
        accepted.push(operation);
    }
    overflow.extend(operations);

    let encoded: Vec<_> = accepted
        .iter()
        .filter_map(|operation| {
            let operation = operation.as_ref();
            operation.materialize().ok().map(|m| (operation, m))
        })
        .collect();
    let body = wire::encode_body(encoded.into_iter(), approximate_size);

    PackResult {
        batch: Batch {
            operations: accepted,
            body,
            approximate_size,
        },
        overflow,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::wire::decode_body;

    /// A create operation whose approximate size is exactly `size` bytes.
    fn sized(size: usize) -> Operation {
        // `["pk"]` accounts for six bytes.
        Operation::create_raw("pk", Bytes::from(vec![b'x'; size - 6]))
    }

    #[test]
    fn test_pack_then_pack_overflow() {
        let operations = vec![sized(100), sized(100), sized(900)];

        let first = pack(operations, 1000, 10);
        assert_eq!(first.batch.len(), 2);
        assert_eq!(first.batch.approximate_size(), 200);
        assert_eq!(first.overflow.len(), 1);
        assert!(first.rejected.is_empty());

        let second = pack(first.overflow, 1000, 10);
        assert_eq!(second.batch.len(), 1);
        assert_eq!(second.batch.approximate_size(), 900);
        assert!(second.overflow.is_empty());
    }

    #[test]
    fn test_oversized_operation_goes_alone() {
        let first = pack(vec![sized(5000), sized(10)], 1000, 10);
        assert_eq!(first.batch.len(), 1);
        assert_eq!(first.batch.approximate_size(), 5000);
        assert_eq!(first.overflow.len(), 1);

        // Behind a smaller operation, the oversized one waits for its own batch.
        let second = pack(vec![sized(10), sized(5000)], 1000, 10);
        assert_eq!(second.batch.len(), 1);
        assert_eq!(second.batch.approximate_size(), 10);
        assert_eq!(second.overflow.len(), 1);
    }

    #[test]
    fn test_pack_stops_at_first_misfit() {
        // The small trailing operation would fit, but packing is prefix only.
        let result = pack(vec![sized(600), sized(600), sized(10)], 1000, 10);
        assert_eq!(result.batch.len(), 1);
        assert_eq!(result.overflow.len(), 2);
        assert_eq!(result.overflow[1].approximate_size().unwrap(), 10);
    }

    #[test]
    fn test_pack_respects_operation_count() {
        let operations: Vec<_> = (0..7).map(|_| sized(10)).collect();
        let result = pack(operations, 1000, 3);
        assert_eq!(result.batch.len(), 3);
        assert_eq!(result.overflow.len(), 4);
    }

    #[test]
    fn test_packed_body_preserves_order() {
        let operations = vec![
            Operation::read("pk", "a"),
            Operation::read("pk", "b"),
            Operation::delete("pk", "c"),
        ];
        let result = pack(operations, 1000, 10);
        let decoded = decode_body(result.batch.body().clone()).unwrap();

        let ids: Vec<_> = decoded.iter().map(|op| op.id.as_deref().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let indices: Vec<_> = decoded.iter().map(|op| op.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    proptest! {
        #[test]
        fn prop_pack_bounds_and_order(
            sizes in prop::collection::vec(7usize..400, 1..40),
            max_body_bytes in 50usize..1500,
            max_operation_count in 1usize..12,
        ) {
            let operations: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| sized(*size).with_id(format!("{i:04}")))
                .collect();

            let result = pack(operations, max_body_bytes, max_operation_count);
            let batch_len = result.batch.len();

            prop_assert!(batch_len >= 1);
            prop_assert!(batch_len <= max_operation_count);
            prop_assert!(
                batch_len == 1 || result.batch.approximate_size() <= max_body_bytes
            );
            prop_assert_eq!(batch_len + result.overflow.len(), sizes.len());

            let ids: Vec<_> = result
                .batch
                .operations()
                .iter()
                .chain(result.overflow.iter())
                .map(|op| op.id().unwrap().to_string())
                .collect();
            let expected: Vec<_> = (0..sizes.len()).map(|i| format!("{i:04}")).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
