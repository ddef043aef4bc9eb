//! Streaming parsers for Fever API responses.
//!
//! Fever wraps everything in one JSON object whose keys vary by endpoint
//! (`items`, `feeds`, `groups`, id lists), with server-specific extras mixed
//! in at every level. These parsers walk the token stream directly through
//! hand-written [`serde::de`] visitors: field names dispatch through derived
//! `field_identifier` enums (a precomputed name table, not per-key string
//! comparisons), unknown fields are consumed as [`IgnoredAny`], and no
//! intermediate value tree is built.
//!
//! Numeric coercion happens here, at the edge: Fever serves `id` and
//! `feed_id` as either JSON numbers or strings depending on the
//! implementation, and both normalize to the item's decimal string form
//! before anything downstream sees them.

use std::fmt;

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::Deserialize;

use crate::api::{epoch_to_datetime, ItemDraft, ParseError};
use crate::storage::Item;

// ============================================================================
// Wire Scalars
// ============================================================================

/// An id that may arrive as a JSON string or integer.
struct FlexId(String);

impl<'de> Deserialize<'de> for FlexId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FlexIdVisitor;

        impl Visitor<'_> for FlexIdVisitor {
            type Value = FlexId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or integer id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<FlexId, E> {
                Ok(FlexId(v.to_owned()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FlexId, E> {
                Ok(FlexId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<FlexId, E> {
                Ok(FlexId(v.to_string()))
            }
        }

        deserializer.deserialize_any(FlexIdVisitor)
    }
}

/// Splits Fever's comma-joined id strings, tolerating empty segments.
fn split_id_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

// ============================================================================
// Items
// ============================================================================

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum ItemField {
    Id,
    FeedId,
    Title,
    Author,
    Html,
    Url,
    IsRead,
    IsSaved,
    CreatedOnTime,
    #[serde(other)]
    Other,
}

struct WireItem(Item);

impl<'de> Deserialize<'de> for WireItem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ItemVisitor;

        impl<'de> Visitor<'de> for ItemVisitor {
            type Value = WireItem;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever item object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<WireItem, A::Error> {
                let mut draft = ItemDraft::default();

                while let Some(field) = map.next_key::<ItemField>()? {
                    match field {
                        ItemField::Id => {
                            let FlexId(id) = map.next_value()?;
                            draft.remote_id = Some(id);
                        }
                        ItemField::FeedId => {
                            let FlexId(id) = map.next_value()?;
                            if id.is_empty() {
                                return Err(de::Error::custom("feed_id must not be empty"));
                            }
                            draft.feed_remote_id = Some(id);
                        }
                        ItemField::Title => draft.title = Some(map.next_value()?),
                        ItemField::Author => draft.author = map.next_value()?,
                        ItemField::Html => draft.content = map.next_value()?,
                        ItemField::Url => draft.link = map.next_value()?,
                        ItemField::IsRead => draft.is_read = map.next_value::<i64>()? != 0,
                        ItemField::IsSaved => draft.is_starred = map.next_value::<i64>()? != 0,
                        ItemField::CreatedOnTime => {
                            let secs: i64 = map.next_value()?;
                            draft.pub_date =
                                Some(epoch_to_datetime(secs).map_err(de::Error::custom)?);
                        }
                        ItemField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                draft.freeze().map(WireItem).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_map(ItemVisitor)
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum ItemsDocField {
    Items,
    #[serde(other)]
    Other,
}

struct ItemsDocument(Vec<Item>);

impl<'de> Deserialize<'de> for ItemsDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = ItemsDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever items response")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ItemsDocument, A::Error> {
                let mut items: Option<Vec<WireItem>> = None;

                while let Some(field) = map.next_key::<ItemsDocField>()? {
                    match field {
                        ItemsDocField::Items => {
                            if items.is_some() {
                                return Err(de::Error::duplicate_field("items"));
                            }
                            items = Some(map.next_value()?);
                        }
                        ItemsDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                // Unlike the Google Reader dialect, a Fever response without
                // an items array is malformed, not empty.
                let items = items.ok_or_else(|| de::Error::missing_field("items"))?;
                Ok(ItemsDocument(items.into_iter().map(|w| w.0).collect()))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Parses an `?api&items` response into canonical items, in wire order.
pub fn parse_items(body: &[u8]) -> Result<Vec<Item>, ParseError> {
    let doc: ItemsDocument = serde_json::from_slice(body)?;
    Ok(doc.0)
}

// ============================================================================
// Feeds and Groups
// ============================================================================

/// A feed as Fever reports it. `title` is empty when the server omits one;
/// the repository falls back to the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeverFeed {
    pub id: i64,
    pub title: String,
    pub url: Option<String>,
    pub site_url: Option<String>,
}

/// One group-membership entry: which feeds belong to `group_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedsGroup {
    pub group_id: i64,
    pub feed_ids: Vec<i64>,
}

/// The `?api&feeds` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedsDocument {
    pub feeds: Vec<FeverFeed>,
    pub feeds_groups: Vec<FeedsGroup>,
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum FeedField {
    Id,
    Title,
    Url,
    SiteUrl,
    #[serde(other)]
    Other,
}

impl<'de> Deserialize<'de> for FeverFeed {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FeedVisitor;

        impl<'de> Visitor<'de> for FeedVisitor {
            type Value = FeverFeed;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever feed object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FeverFeed, A::Error> {
                let mut id: Option<i64> = None;
                let mut title = String::new();
                let mut url: Option<String> = None;
                let mut site_url: Option<String> = None;

                while let Some(field) = map.next_key::<FeedField>()? {
                    match field {
                        FeedField::Id => id = Some(map.next_value()?),
                        FeedField::Title => title = map.next_value()?,
                        FeedField::Url => url = map.next_value()?,
                        FeedField::SiteUrl => site_url = map.next_value()?,
                        FeedField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(FeverFeed {
                    id: id.ok_or_else(|| de::Error::missing_field("id"))?,
                    title,
                    url,
                    site_url,
                })
            }
        }

        deserializer.deserialize_map(FeedVisitor)
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum FeedsGroupField {
    GroupId,
    FeedIds,
    #[serde(other)]
    Other,
}

impl<'de> Deserialize<'de> for FeedsGroup {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MembershipVisitor;

        impl<'de> Visitor<'de> for MembershipVisitor {
            type Value = FeedsGroup;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever feeds_groups object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FeedsGroup, A::Error> {
                let mut group_id: Option<i64> = None;
                let mut feed_ids: Vec<i64> = Vec::new();

                while let Some(field) = map.next_key::<FeedsGroupField>()? {
                    match field {
                        FeedsGroupField::GroupId => group_id = Some(map.next_value()?),
                        FeedsGroupField::FeedIds => {
                            let joined: String = map.next_value()?;
                            feed_ids = split_id_list(&joined)
                                .iter()
                                .map(|s| {
                                    s.parse::<i64>().map_err(|_| {
                                        de::Error::custom(format!("invalid feed id: {s}"))
                                    })
                                })
                                .collect::<Result<_, _>>()?;
                        }
                        FeedsGroupField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(FeedsGroup {
                    group_id: group_id.ok_or_else(|| de::Error::missing_field("group_id"))?,
                    feed_ids,
                })
            }
        }

        deserializer.deserialize_map(MembershipVisitor)
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum FeedsDocField {
    Feeds,
    FeedsGroups,
    #[serde(other)]
    Other,
}

impl<'de> Deserialize<'de> for FeedsDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = FeedsDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever feeds response")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FeedsDocument, A::Error> {
                let mut feeds: Option<Vec<FeverFeed>> = None;
                let mut feeds_groups: Vec<FeedsGroup> = Vec::new();

                while let Some(field) = map.next_key::<FeedsDocField>()? {
                    match field {
                        FeedsDocField::Feeds => {
                            if feeds.is_some() {
                                return Err(de::Error::duplicate_field("feeds"));
                            }
                            feeds = Some(map.next_value()?);
                        }
                        FeedsDocField::FeedsGroups => feeds_groups = map.next_value()?,
                        FeedsDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(FeedsDocument {
                    feeds: feeds.ok_or_else(|| de::Error::missing_field("feeds"))?,
                    feeds_groups,
                })
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Parses an `?api&feeds` response.
pub fn parse_feeds(body: &[u8]) -> Result<FeedsDocument, ParseError> {
    let doc: FeedsDocument = serde_json::from_slice(body)?;
    Ok(doc)
}

/// A Fever group (the protocol's name for a folder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeverGroup {
    pub id: i64,
    pub title: String,
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum GroupField {
    Id,
    Title,
    #[serde(other)]
    Other,
}

impl<'de> Deserialize<'de> for FeverGroup {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct GroupVisitor;

        impl<'de> Visitor<'de> for GroupVisitor {
            type Value = FeverGroup;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever group object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FeverGroup, A::Error> {
                let mut id: Option<i64> = None;
                let mut title = String::new();

                while let Some(field) = map.next_key::<GroupField>()? {
                    match field {
                        GroupField::Id => id = Some(map.next_value()?),
                        GroupField::Title => title = map.next_value()?,
                        GroupField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(FeverGroup {
                    id: id.ok_or_else(|| de::Error::missing_field("id"))?,
                    title,
                })
            }
        }

        deserializer.deserialize_map(GroupVisitor)
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum GroupsDocField {
    Groups,
    #[serde(other)]
    Other,
}

struct GroupsDocument(Vec<FeverGroup>);

impl<'de> Deserialize<'de> for GroupsDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = GroupsDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever groups response")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<GroupsDocument, A::Error> {
                let mut groups: Option<Vec<FeverGroup>> = None;

                while let Some(field) = map.next_key::<GroupsDocField>()? {
                    match field {
                        GroupsDocField::Groups => {
                            if groups.is_some() {
                                return Err(de::Error::duplicate_field("groups"));
                            }
                            groups = Some(map.next_value()?);
                        }
                        GroupsDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(GroupsDocument(
                    groups.ok_or_else(|| de::Error::missing_field("groups"))?,
                ))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Parses an `?api&groups` response.
pub fn parse_groups(body: &[u8]) -> Result<Vec<FeverGroup>, ParseError> {
    let doc: GroupsDocument = serde_json::from_slice(body)?;
    Ok(doc.0)
}

// ============================================================================
// State Id Lists and Auth
// ============================================================================

/// Id lists from `?api&unread_item_ids` / `?api&saved_item_ids`.
///
/// Fever sends one key per endpoint; whichever is absent stays `None`. Ids
/// stay strings because that is what items carry as remote ids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ItemIds {
    pub unread: Option<Vec<String>>,
    pub saved: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum IdsDocField {
    UnreadItemIds,
    SavedItemIds,
    #[serde(other)]
    Other,
}

impl<'de> Deserialize<'de> for ItemIds {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = ItemIds;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever id list response")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ItemIds, A::Error> {
                let mut ids = ItemIds::default();

                while let Some(field) = map.next_key::<IdsDocField>()? {
                    match field {
                        IdsDocField::UnreadItemIds => {
                            let joined: String = map.next_value()?;
                            ids.unread = Some(split_id_list(&joined));
                        }
                        IdsDocField::SavedItemIds => {
                            let joined: String = map.next_value()?;
                            ids.saved = Some(split_id_list(&joined));
                        }
                        IdsDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                Ok(ids)
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Parses either state id-list response.
pub fn parse_item_ids(body: &[u8]) -> Result<ItemIds, ParseError> {
    let ids: ItemIds = serde_json::from_slice(body)?;
    Ok(ids)
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "snake_case")]
enum AuthDocField {
    Auth,
    #[serde(other)]
    Other,
}

struct AuthDocument(bool);

impl<'de> Deserialize<'de> for AuthDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = AuthDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a Fever response carrying an auth flag")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<AuthDocument, A::Error> {
                let mut auth: Option<i64> = None;

                while let Some(field) = map.next_key::<AuthDocField>()? {
                    match field {
                        AuthDocField::Auth => auth = Some(map.next_value()?),
                        AuthDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                let auth = auth.ok_or_else(|| de::Error::missing_field("auth"))?;
                Ok(AuthDocument(auth == 1))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Extracts the `auth` flag every Fever response carries.
pub fn parse_auth(body: &[u8]) -> Result<bool, ParseError> {
    let doc: AuthDocument = serde_json::from_slice(body)?;
    Ok(doc.0)
}
