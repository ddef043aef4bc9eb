use chrono::{Duration, Utc};
use thiserror::Error;

// ============================================================================
// Filter Model
// ============================================================================

/// Primary item list filter. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MainFilter {
    /// Every item for the account.
    #[default]
    All,
    /// Starred items only.
    Stars,
    /// Items published within the last 24 hours.
    New,
}

/// Secondary scope filter, applied on top of the main filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubFilter {
    #[default]
    None,
    /// Restrict to a single feed; requires [`QueryFilters::filter_feed_id`].
    Feed,
    /// Restrict to a single folder; requires [`QueryFilters::filter_folder_id`].
    Folder,
}

/// Sort direction for the item list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestToOldest,
    OldestToNewest,
}

impl SortOrder {
    /// The ORDER BY clause for this direction.
    pub const fn sql_clause(&self) -> &'static str {
        match self {
            SortOrder::NewestToOldest => "items.pub_date DESC",
            SortOrder::OldestToNewest => "items.pub_date ASC",
        }
    }
}

/// Everything that shapes an item list query.
///
/// The defaults describe the plain timeline: all items, read ones included,
/// newest first. `account_id` has no meaningful default and must be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilters {
    pub account_id: i64,
    pub main_filter: MainFilter,
    pub sub_filter: SubFilter,
    pub filter_feed_id: Option<i64>,
    pub filter_folder_id: Option<i64>,
    pub sort_order: SortOrder,
    pub show_read: bool,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            account_id: 0,
            main_filter: MainFilter::default(),
            sub_filter: SubFilter::default(),
            filter_feed_id: None,
            filter_folder_id: None,
            sort_order: SortOrder::default(),
            show_read: true,
        }
    }
}

/// Rejected filter combinations.
///
/// These are caller bugs, not user input problems: the query builder refuses
/// to emit SQL rather than silently producing an unscoped query.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("account id must be positive (got {0})")]
    MissingAccountId(i64),
    #[error("feed sub-filter requires filter_feed_id")]
    MissingFeedFilter,
    #[error("folder sub-filter requires filter_folder_id")]
    MissingFolderFilter,
}

impl QueryFilters {
    fn validate(&self) -> Result<(), QueryError> {
        if self.account_id <= 0 {
            return Err(QueryError::MissingAccountId(self.account_id));
        }
        if self.sub_filter == SubFilter::Feed && self.filter_feed_id.is_none() {
            return Err(QueryError::MissingFeedFilter);
        }
        if self.sub_filter == SubFilter::Folder && self.filter_folder_id.is_none() {
            return Err(QueryError::MissingFolderFilter);
        }
        Ok(())
    }
}

// ============================================================================
// Query Builder
// ============================================================================

const PROJECTION: &str = "items.id AS id, items.remote_id AS remote_id, \
     items.feed_id AS feed_id, items.title AS title, items.author AS author, \
     items.content AS content, items.link AS link, items.pub_date AS pub_date, \
     feeds.name AS feed_name, feeds.account_id AS account_id, \
     feeds.folder_id AS folder_id, folders.name AS folder_name";

const STATE_PROJECTION: &str = "items.read AS read, items.starred AS starred";

// An item with no item_states row counts as read and unstarred: Fever only
// reports unread and saved ids, so absence means neither.
const SEPARATE_STATE_PROJECTION: &str =
    "CASE WHEN item_states.remote_id IS NULL OR item_states.read = 1 THEN 1 ELSE 0 END AS read, \
     CASE WHEN item_states.starred = 1 THEN 1 ELSE 0 END AS starred";

const FROM_TABLES: &str = "items \
     INNER JOIN feeds ON items.feed_id = feeds.id \
     LEFT JOIN folders ON feeds.folder_id = folders.id";

const SEPARATE_STATE_JOIN: &str = " LEFT JOIN item_states \
     ON item_states.remote_id = items.remote_id \
     AND item_states.account_id = feeds.account_id";

/// Builds the item list SELECT for the given filters.
///
/// The output is a complete SQL string with integer literals inlined; every
/// value interpolated here is an `i64`, so no quoting or escaping questions
/// arise. With `separate_state` the read/starred columns are projected from
/// the `item_states` join instead of the item rows, and read/starred
/// predicates move there too.
///
/// # Errors
///
/// Returns [`QueryError`] when `account_id` is not positive or a sub-filter
/// is selected without its id.
pub fn build_items_query(
    filters: &QueryFilters,
    separate_state: bool,
) -> Result<String, QueryError> {
    filters.validate()?;

    let mut predicates: Vec<String> = Vec::with_capacity(4);

    predicates.push(format!("feeds.account_id = {}", filters.account_id));

    match filters.main_filter {
        MainFilter::All => {}
        MainFilter::Stars => {
            if separate_state {
                predicates.push("item_states.starred = 1".to_owned());
            } else {
                predicates.push("items.starred = 1".to_owned());
            }
        }
        MainFilter::New => {
            let cutoff = (Utc::now() - Duration::days(1)).timestamp();
            predicates.push(format!("items.pub_date > {cutoff}"));
        }
    }

    match filters.sub_filter {
        SubFilter::None => {}
        SubFilter::Feed => {
            // validate() guarantees the id is present
            if let Some(feed_id) = filters.filter_feed_id {
                predicates.push(format!("items.feed_id = {feed_id}"));
            }
        }
        SubFilter::Folder => {
            if let Some(folder_id) = filters.filter_folder_id {
                predicates.push(format!("feeds.folder_id = {folder_id}"));
            }
        }
    }

    if !filters.show_read {
        if separate_state {
            predicates.push("item_states.read = 0".to_owned());
        } else {
            predicates.push("items.read = 0".to_owned());
        }
    }

    let mut sql = String::with_capacity(640);
    sql.push_str("SELECT ");
    sql.push_str(PROJECTION);
    sql.push_str(", ");
    sql.push_str(if separate_state {
        SEPARATE_STATE_PROJECTION
    } else {
        STATE_PROJECTION
    });
    sql.push_str(" FROM ");
    sql.push_str(FROM_TABLES);
    if separate_state {
        sql.push_str(SEPARATE_STATE_JOIN);
    }
    sql.push_str(" WHERE ");
    sql.push_str(&predicates.join(" AND "));
    sql.push_str(" ORDER BY ");
    sql.push_str(filters.sort_order.sql_clause());

    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: i64) -> QueryFilters {
        QueryFilters {
            account_id: id,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_scope_to_account_and_sort_newest_first() {
        let sql = build_items_query(&account(1), false).unwrap();

        assert!(sql.contains("feeds.account_id = 1"));
        assert!(sql.ends_with("ORDER BY items.pub_date DESC"));
        // show_read defaults to true, so no read predicate
        assert!(!sql.contains("read = 0"));
    }

    #[test]
    fn account_predicate_appears_exactly_once() {
        let sql = build_items_query(&account(1), false).unwrap();
        assert_eq!(sql.matches("feeds.account_id =").count(), 1);
    }

    #[test]
    fn feed_sub_filter_pins_the_feed() {
        let filters = QueryFilters {
            sub_filter: SubFilter::Feed,
            filter_feed_id: Some(15),
            ..account(1)
        };
        let sql = build_items_query(&filters, false).unwrap();
        assert!(sql.contains("items.feed_id = 15"));
    }

    #[test]
    fn folder_sub_filter_pins_the_folder() {
        let filters = QueryFilters {
            sub_filter: SubFilter::Folder,
            filter_folder_id: Some(1),
            ..account(1)
        };
        let sql = build_items_query(&filters, false).unwrap();
        assert!(sql.contains("feeds.folder_id = 1"));
    }

    #[test]
    fn stars_filter_uses_item_column() {
        let filters = QueryFilters {
            main_filter: MainFilter::Stars,
            ..account(1)
        };
        let sql = build_items_query(&filters, false).unwrap();
        assert!(sql.contains("items.starred = 1"));
    }

    #[test]
    fn new_filter_cuts_off_at_a_timestamp() {
        let filters = QueryFilters {
            main_filter: MainFilter::New,
            ..account(1)
        };
        let sql = build_items_query(&filters, false).unwrap();
        assert!(sql.contains("items.pub_date > "));
    }

    #[test]
    fn oldest_first_with_hidden_read_items() {
        let filters = QueryFilters {
            sort_order: SortOrder::OldestToNewest,
            show_read: false,
            ..account(1)
        };
        let sql = build_items_query(&filters, false).unwrap();
        assert!(sql.contains("items.read = 0"));
        assert!(sql.ends_with("ORDER BY items.pub_date ASC"));
    }

    #[test]
    fn separate_state_redirects_predicates_to_item_states() {
        let filters = QueryFilters {
            main_filter: MainFilter::Stars,
            show_read: false,
            ..account(1)
        };
        let sql = build_items_query(&filters, true).unwrap();

        assert!(sql.contains("LEFT JOIN item_states"));
        assert!(sql.contains("item_states.starred = 1"));
        assert!(sql.contains("item_states.read = 0"));
        // Base-table state never appears: the projection switches to CASE
        // expressions and the predicates move to the joined table.
        assert!(!sql.contains("items.starred = 1"));
        assert!(!sql.contains("items.read = 0"));
        assert!(sql.contains("CASE WHEN item_states.remote_id IS NULL"));
    }

    #[test]
    fn plain_accounts_skip_the_state_join() {
        let sql = build_items_query(&account(1), false).unwrap();
        assert!(!sql.contains("item_states"));
        assert!(sql.contains("items.read AS read"));
    }

    #[test]
    fn missing_account_id_is_rejected() {
        let err = build_items_query(&QueryFilters::default(), false).unwrap_err();
        assert_eq!(err, QueryError::MissingAccountId(0));

        let err = build_items_query(&account(-3), false).unwrap_err();
        assert_eq!(err, QueryError::MissingAccountId(-3));
    }

    #[test]
    fn feed_sub_filter_without_id_is_rejected() {
        let filters = QueryFilters {
            sub_filter: SubFilter::Feed,
            ..account(1)
        };
        assert_eq!(
            build_items_query(&filters, false).unwrap_err(),
            QueryError::MissingFeedFilter
        );
    }

    #[test]
    fn folder_sub_filter_without_id_is_rejected() {
        let filters = QueryFilters {
            sub_filter: SubFilter::Folder,
            ..account(1)
        };
        assert_eq!(
            build_items_query(&filters, false).unwrap_err(),
            QueryError::MissingFolderFilter
        );
    }

    #[test]
    fn predicates_compose_in_a_single_where_clause() {
        let filters = QueryFilters {
            main_filter: MainFilter::Stars,
            sub_filter: SubFilter::Folder,
            filter_folder_id: Some(7),
            show_read: false,
            ..account(2)
        };
        let sql = build_items_query(&filters, false).unwrap();

        assert_eq!(sql.matches(" WHERE ").count(), 1);
        let where_clause = sql.split(" WHERE ").nth(1).unwrap();
        assert!(where_clause.contains("feeds.account_id = 2"));
        assert!(where_clause.contains("items.starred = 1"));
        assert!(where_clause.contains("feeds.folder_id = 7"));
        assert!(where_clause.contains("items.read = 0"));
        assert_eq!(where_clause.matches(" AND ").count(), 3);
    }
}
