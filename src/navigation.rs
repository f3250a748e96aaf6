//! Navigation over a [`Collection`] by identity.
//!
//! Pure functions: no I/O, no clocks. Empty groups are never returned as a
//! target; any run of them is skipped in a single call.

use crate::error::{Error, Result};
use crate::model::{Collection, Cursor, Item};

/// Outcome of a navigation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavResult {
    /// Next or previous item in the same group.
    WithinGroup(Cursor),
    /// First item of a later non-empty group.
    NextGroup(Cursor),
    /// Last item of an earlier non-empty group.
    PreviousGroup(Cursor),
    /// Nothing left ahead.
    Completed,
    /// Already at the first item of the first non-empty group.
    AtBeginning,
}

impl NavResult {
    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            NavResult::WithinGroup(c) | NavResult::NextGroup(c) | NavResult::PreviousGroup(c) => {
                Some(c)
            }
            NavResult::Completed | NavResult::AtBeginning => None,
        }
    }

    pub fn changes_group(&self) -> bool {
        matches!(self, NavResult::NextGroup(_) | NavResult::PreviousGroup(_))
    }
}

/// First item of the first non-empty group, or `None` when every group is empty.
pub fn initial_cursor(collection: &Collection) -> Option<Cursor> {
    collection
        .groups
        .iter()
        .find_map(|g| g.first().map(|item| Cursor::at(g, item)))
}

/// First item that has not been viewed yet, falling back to [`initial_cursor`].
pub fn first_unviewed(collection: &Collection) -> Option<Cursor> {
    next_unviewed(collection).or_else(|| initial_cursor(collection))
}

/// First item that has not been viewed yet. `None` once everything is viewed.
pub fn next_unviewed(collection: &Collection) -> Option<Cursor> {
    collection.groups.iter().find_map(|g| {
        g.items
            .iter()
            .find(|item| !item.is_viewed())
            .map(|item| Cursor::at(g, item))
    })
}

pub fn next(collection: &Collection, cursor: &Cursor) -> NavResult {
    let Some((group_idx, item_idx)) = locate(collection, cursor) else {
        tracing::debug!("Cursor {} no longer in collection, nothing ahead", cursor);
        return NavResult::Completed;
    };

    let group = &collection.groups[group_idx];
    if let Some(item) = group.items.get(item_idx + 1) {
        return NavResult::WithinGroup(Cursor::at(group, item));
    }

    collection.groups[group_idx + 1..]
        .iter()
        .find_map(|g| g.first().map(|item| NavResult::NextGroup(Cursor::at(g, item))))
        .unwrap_or(NavResult::Completed)
}

pub fn previous(collection: &Collection, cursor: &Cursor) -> NavResult {
    let Some((group_idx, item_idx)) = locate(collection, cursor) else {
        tracing::debug!("Cursor {} no longer in collection, nothing behind", cursor);
        return NavResult::AtBeginning;
    };

    let group = &collection.groups[group_idx];
    if item_idx > 0 {
        return NavResult::WithinGroup(Cursor::at(group, &group.items[item_idx - 1]));
    }

    collection.groups[..group_idx]
        .iter()
        .rev()
        .find_map(|g| g.last().map(|item| NavResult::PreviousGroup(Cursor::at(g, item))))
        .unwrap_or(NavResult::AtBeginning)
}

/// Cursor for an arbitrary item.
pub fn jump(collection: &Collection, item_id: &str) -> Result<Cursor> {
    collection
        .group_containing(item_id)
        .and_then(|g| g.items.iter().find(|i| i.id == item_id).map(|i| Cursor::at(g, i)))
        .ok_or_else(|| Error::not_found("item", item_id))
}

/// Cursor for the first item of a group. Empty groups are not targets.
pub fn jump_to_group(collection: &Collection, group_id: &str) -> Result<Cursor> {
    collection
        .group(group_id)
        .and_then(|g| g.first().map(|item| Cursor::at(g, item)))
        .ok_or_else(|| Error::not_found("group", group_id))
}

/// The item `next` would move to, if any.
pub fn peek_next<'a>(collection: &'a Collection, cursor: &Cursor) -> Option<&'a Item> {
    let target = next(collection, cursor);
    let cursor = target.cursor()?;
    resolve(collection, cursor)
}

/// The item a cursor points at.
pub fn resolve<'a>(collection: &'a Collection, cursor: &Cursor) -> Option<&'a Item> {
    let (g, i) = locate(collection, cursor)?;
    Some(&collection.groups[g].items[i])
}

/// Current indices of the cursor. Only valid for this borrow of `collection`.
fn locate(collection: &Collection, cursor: &Cursor) -> Option<(usize, usize)> {
    let by_group = collection
        .group_index(&cursor.group_id)
        .and_then(|g| collection.groups[g].position(&cursor.item_id).map(|i| (g, i)));

    // The item may have moved to another group since the cursor was taken.
    by_group.or_else(|| {
        collection
            .groups
            .iter()
            .enumerate()
            .find_map(|(g, group)| group.position(&cursor.item_id).map(|i| (g, i)))
    })
}
