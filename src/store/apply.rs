//! Write evaluation shared by the store backends
//!
//! Both backends load the current version of every item a write touches, then
//! evaluate conditions and update actions here, so conditional semantics are
//! identical whichever backend is running.

use super::expr::all_match;
use super::{Item, Key, TableSchema, TransactItem, Update, MAX_TRANSACT_ITEMS};
use crate::error::{Error, Result};
use std::collections::HashSet;

/// The outcome of one transaction member: `None` deletes the item
#[derive(Debug)]
pub struct StagedWrite {
    pub table: &'static TableSchema,
    pub key: Key,
    pub item: Option<Item>,
}

pub fn ensure_key_untouched(table: &TableSchema, update: &Update) -> Result<()> {
    for action in &update.actions {
        let attr = action.attribute();
        if attr == table.partition_key || Some(attr) == table.sort_key {
            return Err(Error::invalid_input(format!(
                "cannot update key attribute {} of {}",
                attr, table.name
            )));
        }
    }
    Ok(())
}

/// Apply an update to a possibly-absent item, enforcing its conditions
pub fn apply_update(
    table: &TableSchema,
    key: &Key,
    existing: Option<&Item>,
    update: &Update,
) -> Result<Item> {
    ensure_key_untouched(table, update)?;
    if !all_match(&update.conditions, existing) {
        return Err(Error::conflict(format!(
            "condition failed for {} {}",
            table.name, key
        )));
    }
    let mut item = existing.cloned().unwrap_or_else(|| table.key_item(key));
    for action in &update.actions {
        action.apply(&mut item)?;
    }
    Ok(item)
}

/// Primary keys a transaction touches, in submission order
pub fn transaction_keys(items: &[TransactItem]) -> Result<Vec<(&'static TableSchema, Key)>> {
    if items.is_empty() || items.len() > MAX_TRANSACT_ITEMS {
        return Err(Error::invalid_input(format!(
            "transactions take 1..={} items, got {}",
            MAX_TRANSACT_ITEMS,
            items.len()
        )));
    }

    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(items.len());
    for member in items {
        let table = member.table();
        let key = match member {
            TransactItem::Put { item, .. } => table.key_of(item)?,
            TransactItem::Update { key, .. }
            | TransactItem::Delete { key, .. }
            | TransactItem::ConditionCheck { key, .. } => key.clone(),
        };
        if !seen.insert((table.name, key.clone())) {
            return Err(Error::invalid_input(format!(
                "transaction touches {} {} more than once",
                table.name, key
            )));
        }
        keys.push((table, key));
    }
    Ok(keys)
}

/// Evaluate every member against the current items. Any failed condition rejects
/// the whole transaction with a conflict naming the offending member.
pub fn stage_transaction<'a>(
    items: &[TransactItem],
    current: impl Fn(&TableSchema, &Key) -> Option<&'a Item>,
) -> Result<Vec<StagedWrite>> {
    let keys = transaction_keys(items)?;
    let mut staged = Vec::with_capacity(items.len());

    for (position, (member, (table, key))) in items.iter().zip(keys).enumerate() {
        let existing = current(table, &key);
        let failed = |verb: &str| {
            Error::conflict(format!(
                "transaction item {} ({} {} {}) failed its condition",
                position, verb, table.name, key
            ))
        };

        let next = match member {
            TransactItem::Put {
                item, conditions, ..
            } => {
                if !all_match(conditions, existing) {
                    return Err(failed("put"));
                }
                Some(item.clone())
            }
            TransactItem::Update { update, .. } => {
                let next = apply_update(table, &key, existing, update).map_err(|e| {
                    if e.is_conflict() {
                        failed("update")
                    } else {
                        e
                    }
                })?;
                Some(next)
            }
            TransactItem::Delete { conditions, .. } => {
                if !all_match(conditions, existing) {
                    return Err(failed("delete"));
                }
                None
            }
            TransactItem::ConditionCheck { conditions, .. } => {
                if !all_match(conditions, existing) {
                    return Err(failed("check"));
                }
                continue;
            }
        };
        staged.push(StagedWrite {
            table,
            key,
            item: next,
        });
    }
    Ok(staged)
}
