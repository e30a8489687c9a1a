//! Typed access to the sled default tree
//!
//! Everything durable lives in the default tree under prefixed keys:
//! `req:` requests, `line:` line-id -> request-id index, `inv:` inventory
//! counters, `led:` ledger entries, `aud:` audit events, `meta:` sequence
//! counters. Values are minicbor. Sequence-keyed prefixes use big-endian
//! u64 suffixes so lexicographic iteration is append order.
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Tree};

use crate::error::WorkflowError;

pub(crate) type TxResult<T> = Result<T, ConflictableTransactionError<WorkflowError>>;

pub(crate) fn abort(e: WorkflowError) -> ConflictableTransactionError<WorkflowError> {
    ConflictableTransactionError::Abort(e)
}

pub(crate) mod keys {
    pub fn request(id: &str) -> Vec<u8> {
        format!("req:{id}").into_bytes()
    }
    pub fn line_index(line_id: &str) -> Vec<u8> {
        format!("line:{line_id}").into_bytes()
    }
    pub fn item(item_ref: &str) -> Vec<u8> {
        format!("inv:{item_ref}").into_bytes()
    }
    pub fn ledger(seq: u64) -> Vec<u8> {
        let mut key = LEDGER_PREFIX.to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
    pub fn audit(seq: u64) -> Vec<u8> {
        let mut key = AUDIT_PREFIX.to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    pub const LEDGER_PREFIX: &[u8] = b"led:";
    pub const AUDIT_PREFIX: &[u8] = b"aud:";
    pub const LEDGER_SEQ: &[u8] = b"meta:ledger_seq";
    pub const AUDIT_SEQ: &[u8] = b"meta:audit_seq";
}

/// Run a closure as one atomic transaction over the default tree.
/// Conflicting transactions are retried by sled; an abort carries the
/// workflow error out, storage faults map onto the Storage kind.
pub(crate) fn run_tx<A>(
    db: &Db,
    f: impl Fn(&TransactionalTree) -> ConflictableTransactionResult<A, WorkflowError>,
) -> Result<A, WorkflowError> {
    db.transaction(f).map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => WorkflowError::Storage(e.to_string()),
    })
}

pub(crate) fn tx_get<T>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(ivec) => {
            let value = minicbor::decode(&ivec)
                .map_err(|e| abort(WorkflowError::Storage(e.to_string())))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub(crate) fn tx_put<T>(tree: &TransactionalTree, key: Vec<u8>, value: &T) -> TxResult<()>
where
    T: minicbor::Encode<()>,
{
    let bytes =
        minicbor::to_vec(value).map_err(|e| abort(WorkflowError::Storage(e.to_string())))?;
    tree.insert(key, bytes)?;
    Ok(())
}

/// Advance a big-endian u64 counter and return the new value.
pub(crate) fn tx_next_seq(tree: &TransactionalTree, counter_key: &[u8]) -> TxResult<u64> {
    let next = match tree.get(counter_key)? {
        Some(ivec) => decode_seq(&ivec).map_err(abort)? + 1,
        None => 0,
    };
    tree.insert(counter_key, next.to_be_bytes().to_vec())?;
    Ok(next)
}

pub(crate) fn get<T>(tree: &Tree, key: &[u8]) -> Result<Option<T>, WorkflowError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(ivec) => Ok(Some(minicbor::decode(&ivec)?)),
        None => Ok(None),
    }
}

/// Decode every value under a prefix, in key order.
pub(crate) fn scan_prefix<T>(tree: &Tree, prefix: &[u8]) -> Result<Vec<T>, WorkflowError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    let mut out = Vec::new();
    for entry in tree.scan_prefix(prefix) {
        let (_, ivec) = entry?;
        out.push(minicbor::decode(&ivec)?);
    }
    Ok(out)
}

fn decode_seq(bytes: &[u8]) -> Result<u64, WorkflowError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| WorkflowError::Storage("malformed sequence counter".into()))?;
    Ok(u64::from_be_bytes(arr))
}
