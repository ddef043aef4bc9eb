//! Streaming parsers for the Google Reader API dialect served by FreshRSS.
//!
//! Same discipline as the Fever parsers: hand-written visitors over the
//! token stream, derived `field_identifier` enums for name dispatch, unknown
//! fields ignored wherever they appear. The shapes differ though: state
//! arrives inline as category sentinel strings on each item, links hide
//! inside an `alternate` array, and the owning feed is named by
//! `origin.streamId`. And unlike Fever, a response without an `items` key is
//! a valid empty result, not an error.

use std::fmt;

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;

use crate::api::{epoch_to_datetime, ItemDraft, ParseError};
use crate::storage::{Item, RemoteFeed, RemoteFolder};

/// Category sentinel marking an item read.
pub const STATE_READ: &str = "user/-/state/com.google/read";
/// Category sentinel marking an item starred.
pub const STATE_STARRED: &str = "user/-/state/com.google/starred";
/// Prefix of user label (folder) stream ids.
pub const LABEL_PREFIX: &str = "user/-/label/";

// ============================================================================
// Items
// ============================================================================

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "camelCase")]
enum ItemField {
    Id,
    Published,
    Title,
    Summary,
    Alternate,
    Categories,
    Origin,
    Author,
    #[serde(other)]
    Other,
}

/// `summary` is an object; only its `content` matters.
struct SummaryContent(Option<String>);

impl<'de> Deserialize<'de> for SummaryContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            Content,
            #[serde(other)]
            Other,
        }

        struct SummaryVisitor;

        impl<'de> Visitor<'de> for SummaryVisitor {
            type Value = SummaryContent;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a summary object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SummaryContent, A::Error> {
                let mut content: Option<String> = None;
                while let Some(field) = map.next_key::<Field>()? {
                    match field {
                        Field::Content => content = map.next_value()?,
                        Field::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(SummaryContent(content))
            }
        }

        deserializer.deserialize_map(SummaryVisitor)
    }
}

/// One element of the `alternate` array; carries at most an `href`.
struct LinkHref(Option<String>);

impl<'de> Deserialize<'de> for LinkHref {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            Href,
            #[serde(other)]
            Other,
        }

        struct LinkVisitor;

        impl<'de> Visitor<'de> for LinkVisitor {
            type Value = LinkHref;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an alternate link object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<LinkHref, A::Error> {
                let mut href: Option<String> = None;
                while let Some(field) = map.next_key::<Field>()? {
                    match field {
                        Field::Href => href = map.next_value()?,
                        Field::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(LinkHref(href))
            }
        }

        deserializer.deserialize_map(LinkVisitor)
    }
}

/// The whole `alternate` array, collapsed to the last href seen.
struct AlternateLink(Option<String>);

impl<'de> Deserialize<'de> for AlternateLink {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SeqVisitor;

        impl<'de> Visitor<'de> for SeqVisitor {
            type Value = AlternateLink;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an alternate link array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<AlternateLink, A::Error> {
                let mut link: Option<String> = None;
                while let Some(LinkHref(href)) = seq.next_element()? {
                    if href.is_some() {
                        link = href;
                    }
                }
                Ok(AlternateLink(link))
            }
        }

        deserializer.deserialize_seq(SeqVisitor)
    }
}

/// Item categories: a string array whose recognized sentinels set the
/// read/starred flags. Labels and unknown streams pass through unnoticed.
struct CategoryFlags {
    read: bool,
    starred: bool,
}

impl<'de> Deserialize<'de> for CategoryFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SeqVisitor;

        impl<'de> Visitor<'de> for SeqVisitor {
            type Value = CategoryFlags;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a category string array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<CategoryFlags, A::Error> {
                let mut flags = CategoryFlags {
                    read: false,
                    starred: false,
                };
                while let Some(category) = seq.next_element::<String>()? {
                    match category.as_str() {
                        STATE_READ => flags.read = true,
                        STATE_STARRED => flags.starred = true,
                        _ => {}
                    }
                }
                Ok(flags)
            }
        }

        deserializer.deserialize_seq(SeqVisitor)
    }
}

/// `origin` object; only `streamId` (the owning feed) matters.
struct OriginStream(Option<String>);

impl<'de> Deserialize<'de> for OriginStream {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            StreamId,
            #[serde(other)]
            Other,
        }

        struct OriginVisitor;

        impl<'de> Visitor<'de> for OriginVisitor {
            type Value = OriginStream;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an origin object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<OriginStream, A::Error> {
                let mut stream_id: Option<String> = None;
                while let Some(field) = map.next_key::<Field>()? {
                    match field {
                        Field::StreamId => stream_id = map.next_value()?,
                        Field::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(OriginStream(stream_id))
            }
        }

        deserializer.deserialize_map(OriginVisitor)
    }
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
                f.write_str("a reader stream item object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<WireItem, A::Error> {
                let mut draft = ItemDraft::default();

                while let Some(field) = map.next_key::<ItemField>()? {
                    match field {
                        ItemField::Id => draft.remote_id = Some(map.next_value()?),
                        ItemField::Published => {
                            let secs: i64 = map.next_value()?;
                            draft.pub_date =
                                Some(epoch_to_datetime(secs).map_err(de::Error::custom)?);
                        }
                        ItemField::Title => draft.title = Some(map.next_value()?),
                        ItemField::Summary => {
                            let SummaryContent(content) = map.next_value()?;
                            draft.content = content;
                        }
                        ItemField::Alternate => {
                            let AlternateLink(link) = map.next_value()?;
                            draft.link = link;
                        }
                        ItemField::Categories => {
                            let flags: CategoryFlags = map.next_value()?;
                            draft.is_read = flags.read;
                            draft.is_starred = flags.starred;
                        }
                        ItemField::Origin => {
                            let OriginStream(stream_id) = map.next_value()?;
                            draft.feed_remote_id = stream_id;
                        }
                        ItemField::Author => draft.author = map.next_value()?,
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
#[serde(field_identifier, rename_all = "camelCase")]
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
                f.write_str("a reader stream contents response")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ItemsDocument, A::Error> {
                let mut items: Vec<WireItem> = Vec::new();

                while let Some(field) = map.next_key::<ItemsDocField>()? {
                    match field {
                        ItemsDocField::Items => items = map.next_value()?,
                        ItemsDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                // No items key means an empty stream here.
                Ok(ItemsDocument(items.into_iter().map(|w| w.0).collect()))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Parses a `stream/contents` response into canonical items, in wire order.
pub fn parse_items(body: &[u8]) -> Result<Vec<Item>, ParseError> {
    let doc: ItemsDocument = serde_json::from_slice(body)?;
    Ok(doc.0)
}

// ============================================================================
// Tag List (Folders)
// ============================================================================

struct WireTag {
    id: Option<String>,
    kind: Option<String>,
}

impl<'de> Deserialize<'de> for WireTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            Id,
            Type,
            #[serde(other)]
            Other,
        }

        struct TagVisitor;

        impl<'de> Visitor<'de> for TagVisitor {
            type Value = WireTag;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a tag object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<WireTag, A::Error> {
                let mut id: Option<String> = None;
                let mut kind: Option<String> = None;
                while let Some(field) = map.next_key::<Field>()? {
                    match field {
                        Field::Id => id = map.next_value()?,
                        Field::Type => kind = map.next_value()?,
                        Field::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(WireTag { id, kind })
            }
        }

        deserializer.deserialize_map(TagVisitor)
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "camelCase")]
enum TagsDocField {
    Tags,
    #[serde(other)]
    Other,
}

struct TagsDocument(Vec<WireTag>);

impl<'de> Deserialize<'de> for TagsDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = TagsDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a tag list response")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<TagsDocument, A::Error> {
                let mut tags: Vec<WireTag> = Vec::new();
                while let Some(field) = map.next_key::<TagsDocField>()? {
                    match field {
                        TagsDocField::Tags => tags = map.next_value()?,
                        TagsDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(TagsDocument(tags))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Parses `tag/list`, keeping only entries typed `folder`.
///
/// The folder's display name is the last segment of its stream id
/// (`user/-/label/Tech` becomes `Tech`); entries without an id are dropped.
pub fn parse_folders(body: &[u8]) -> Result<Vec<RemoteFolder>, ParseError> {
    let doc: TagsDocument = serde_json::from_slice(body)?;
    let folders = doc
        .0
        .into_iter()
        .filter(|tag| tag.kind.as_deref() == Some("folder"))
        .filter_map(|tag| tag.id)
        .map(|id| {
            let name = id.rsplit('/').next().unwrap_or(&id).to_owned();
            RemoteFolder {
                remote_id: id,
                name,
            }
        })
        .collect();
    Ok(folders)
}

// ============================================================================
// Subscription List (Feeds)
// ============================================================================

/// One element of a subscription's `categories` array; only the stream id
/// is used, and only when it is a user label.
struct SubCategory(Option<String>);

impl<'de> Deserialize<'de> for SubCategory {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            Id,
            #[serde(other)]
            Other,
        }

        struct CategoryVisitor;

        impl<'de> Visitor<'de> for CategoryVisitor {
            type Value = SubCategory;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a subscription category object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SubCategory, A::Error> {
                let mut id: Option<String> = None;
                while let Some(field) = map.next_key::<Field>()? {
                    match field {
                        Field::Id => id = map.next_value()?,
                        Field::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(SubCategory(id))
            }
        }

        deserializer.deserialize_map(CategoryVisitor)
    }
}

struct WireSubscription(RemoteFeed);

impl<'de> Deserialize<'de> for WireSubscription {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            Id,
            Title,
            Categories,
            Url,
            HtmlUrl,
            #[serde(other)]
            Other,
        }

        struct SubVisitor;

        impl<'de> Visitor<'de> for SubVisitor {
            type Value = WireSubscription;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a subscription object")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> Result<WireSubscription, A::Error> {
                let mut id: Option<String> = None;
                let mut title: Option<String> = None;
                let mut url: Option<String> = None;
                let mut site_url: Option<String> = None;
                let mut folder_remote_id: Option<String> = None;

                while let Some(field) = map.next_key::<Field>()? {
                    match field {
                        Field::Id => id = map.next_value()?,
                        Field::Title => title = map.next_value()?,
                        Field::Categories => {
                            let categories: Vec<SubCategory> = map.next_value()?;
                            folder_remote_id = categories
                                .into_iter()
                                .filter_map(|c| c.0)
                                .find(|id| id.starts_with(LABEL_PREFIX));
                        }
                        Field::Url => url = map.next_value()?,
                        Field::HtmlUrl => site_url = map.next_value()?,
                        Field::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }

                let remote_id = match id {
                    Some(id) if !id.is_empty() => id,
                    _ => return Err(de::Error::custom("subscription is missing an id")),
                };
                // A subscription without a usable title falls back to its
                // URL, then to its stream id; feed names are NOT NULL.
                let name = title
                    .filter(|t| !t.is_empty())
                    .or_else(|| url.clone())
                    .unwrap_or_else(|| remote_id.clone());

                Ok(WireSubscription(RemoteFeed {
                    remote_id,
                    name,
                    url,
                    site_url,
                    folder_remote_id,
                }))
            }
        }

        deserializer.deserialize_map(SubVisitor)
    }
}

#[derive(Deserialize)]
#[serde(field_identifier, rename_all = "camelCase")]
enum SubsDocField {
    Subscriptions,
    #[serde(other)]
    Other,
}

struct SubscriptionsDocument(Vec<RemoteFeed>);

impl<'de> Deserialize<'de> for SubscriptionsDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocVisitor;

        impl<'de> Visitor<'de> for DocVisitor {
            type Value = SubscriptionsDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a subscription list response")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> Result<SubscriptionsDocument, A::Error> {
                let mut subs: Vec<WireSubscription> = Vec::new();
                while let Some(field) = map.next_key::<SubsDocField>()? {
                    match field {
                        SubsDocField::Subscriptions => subs = map.next_value()?,
                        SubsDocField::Other => {
                            map.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(SubscriptionsDocument(
                    subs.into_iter().map(|w| w.0).collect(),
                ))
            }
        }

        deserializer.deserialize_map(DocVisitor)
    }
}

/// Parses `subscription/list` into remote feeds with their label links.
pub fn parse_feeds(body: &[u8]) -> Result<Vec<RemoteFeed>, ParseError> {
    let doc: SubscriptionsDocument = serde_json::from_slice(body)?;
    Ok(doc.0)
}
