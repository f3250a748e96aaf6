//! Immutable content model: items, groups and the collection they form.
//!
//! Positions are always expressed as IDs (see [`Cursor`]); nothing in the
//! playback core stores an index across an await point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What an item renders as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ItemKind {
    Image {
        url: String,
    },
    Video {
        url: String,
    },
    Text {
        body: String,
    },
    Custom {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        animated: bool,
    },
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Image { .. } => "image",
            ItemKind::Video { .. } => "video",
            ItemKind::Text { .. } => "text",
            ItemKind::Custom { .. } => "custom",
        }
    }

    /// URL of the downloadable asset, for kinds that have one.
    pub fn source_url(&self) -> Option<&str> {
        match self {
            ItemKind::Image { url } | ItemKind::Video { url } => Some(url),
            ItemKind::Text { .. } | ItemKind::Custom { .. } => None,
        }
    }
}

/// A single timed piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(flatten)]
    pub kind: ItemKind,
    #[serde(default, rename = "durationMs", with = "duration_ms")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub viewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reacted_at: Option<DateTime<Utc>>,
    /// Back-reference to the owning group, for lookups only.
    #[serde(default)]
    pub group_id: String,
}

impl Item {
    pub fn new(id: impl Into<String>, group_id: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: id.into(),
            kind,
            duration: None,
            viewed_at: None,
            reacted_at: None,
            group_id: group_id.into(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_viewed_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            viewed_at: Some(at),
            ..self.clone()
        }
    }

    pub fn with_reacted_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            reacted_at: Some(at),
            ..self.clone()
        }
    }

    pub fn is_viewed(&self) -> bool {
        self.viewed_at.is_some()
    }
}

/// Who a group belongs to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

/// An ordered run of items from one owner. May be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Group {
    /// Build a group, pointing each item's back-reference at it.
    pub fn new(id: impl Into<String>, owner: Owner, items: Vec<Item>) -> Self {
        let id = id.into();
        let items = items
            .into_iter()
            .map(|item| Item {
                group_id: id.clone(),
                ..item
            })
            .collect();
        Self { id, owner, items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == item_id)
    }

    pub fn first(&self) -> Option<&Item> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&Item> {
        self.items.last()
    }
}

/// The root navigable universe.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Collection {
    pub groups: Vec<Group>,
}

impl Collection {
    pub fn new(groups: Vec<Group>) -> Self {
        Self { groups }
    }

    /// Decode a collection from JSON, fixing up item back-references.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let parsed: Collection = serde_json::from_str(json)?;
        Ok(Self::new(
            parsed
                .groups
                .into_iter()
                .map(|g| Group::new(g.id, g.owner, g.items))
                .collect(),
        ))
    }

    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == group_id)
    }

    pub fn group_index(&self, group_id: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.id == group_id)
    }

    /// Find the group holding an item. Linear over groups.
    pub fn group_containing(&self, item_id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.position(item_id).is_some())
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.groups
            .iter()
            .flat_map(|g| g.items.iter())
            .find(|item| item.id == item_id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.groups.iter().flat_map(|g| g.items.iter())
    }

    pub fn total_items(&self) -> usize {
        self.groups.iter().map(|g| g.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }

    /// Copy of the collection with one item replaced by ID.
    pub fn with_item(&self, updated: Item) -> Self {
        let groups = self
            .groups
            .iter()
            .map(|g| {
                let items = g
                    .items
                    .iter()
                    .map(|item| {
                        if item.id == updated.id {
                            Item {
                                group_id: g.id.clone(),
                                ..updated.clone()
                            }
                        } else {
                            item.clone()
                        }
                    })
                    .collect();
                Group {
                    id: g.id.clone(),
                    owner: g.owner.clone(),
                    items,
                }
            })
            .collect();
        Self { groups }
    }
}

/// Current position, by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub group_id: String,
    pub item_id: String,
}

impl Cursor {
    pub fn new(group_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            item_id: item_id.into(),
        }
    }

    pub(crate) fn at(group: &Group, item: &Item) -> Self {
        Self::new(group.id.clone(), item.id.clone())
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_id, self.item_id)
    }
}

/// `Option<Duration>` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
