//! Helpers over ordered lists of pay ids.

use std::collections::HashSet;

use crate::error::CoreError;
use crate::types::PayId;

/// Remove the first occurrence of `id`.
pub fn delete_hash(list: &mut Vec<PayId>, id: &PayId) -> Result<(), CoreError> {
    let pos = list
        .iter()
        .position(|e| e == id)
        .ok_or(CoreError::PayNotFound(*id))?;
    list.remove(pos);
    Ok(())
}

pub fn exist(list: &[PayId], id: &PayId) -> bool {
    list.contains(id)
}

fn unique_set<'a>(list: &'a [PayId], name: &str) -> Result<HashSet<&'a PayId>, CoreError> {
    let mut set = HashSet::with_capacity(list.len());
    for id in list {
        if !set.insert(id) {
            tracing::debug!(list = name, pay_id = %id, "duplicate pay id");
            return Err(CoreError::InvalidPendingPays);
        }
    }
    Ok(set)
}

/// Elements of `a` not in `b`, in `a`'s order.
pub fn difference(a: &[PayId], b: &[PayId]) -> Result<Vec<PayId>, CoreError> {
    let set_b = unique_set(b, "b")?;
    unique_set(a, "a")?;
    Ok(a.iter().filter(|id| !set_b.contains(id)).copied().collect())
}

/// Returns `(a - b, b - a)`. Fails if either list repeats an element.
pub fn symmetric_difference(
    a: &[PayId],
    b: &[PayId],
) -> Result<(Vec<PayId>, Vec<PayId>), CoreError> {
    let set_a = unique_set(a, "a")?;
    let set_b = unique_set(b, "b")?;
    let a_b = a.iter().filter(|id| !set_b.contains(id)).copied().collect();
    let b_a = b.iter().filter(|id| !set_a.contains(id)).copied().collect();
    Ok((a_b, b_a))
}
