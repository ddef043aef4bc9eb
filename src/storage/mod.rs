mod accounts;
mod feeds;
mod folders;
mod items;
mod queries;
mod schema;
mod types;

pub use queries::{build_items_query, MainFilter, QueryError, QueryFilters, SortOrder, SubFilter};
pub use schema::Database;
pub use types::{
    Account, AccountKind, DatabaseError, Feed, Folder, Item, ItemRow, ItemState, RemoteFeed,
    RemoteFolder, StatePolicy,
};
