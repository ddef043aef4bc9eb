//! End-to-end sync tests against mock backends.
//!
//! Each test stands up a wiremock server playing a Fever or FreshRSS
//! instance, runs [`sync_account`] against an in-memory database, and
//! checks what landed: the mirrored folder/feed tree, inserted items,
//! read/star state, watermark progression, and the push of pending local
//! changes on the next sync.

use millrace::api::SyncError;
use millrace::repo::sync_account;
use millrace::storage::{
    build_items_query, Account, AccountKind, Database, MainFilter, QueryFilters,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn account(db: &Database, id: i64) -> Account {
    db.get_account(id).await.unwrap().unwrap()
}

/// Titles visible for an account, newest first.
async fn titles(db: &Database, account: &Account, main: MainFilter, show_read: bool) -> Vec<String> {
    let filters = QueryFilters {
        account_id: account.id,
        main_filter: main,
        show_read,
        ..QueryFilters::default()
    };
    let sql = build_items_query(&filters, account.kind.separate_state()).unwrap();
    db.query_items(&sql)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.title)
        .collect()
}

// ============================================================================
// Fever
// ============================================================================

fn fever_auth_doc() -> serde_json::Value {
    json!({"api_version": 3, "auth": 1})
}

fn fever_item(id: i64, title: &str) -> serde_json::Value {
    json!({
        "id": id,
        "feed_id": 10,
        "title": title,
        "author": "Ann",
        "html": "<p>body</p>",
        "url": format!("https://example.com/{id}"),
        "is_read": 0,
        "is_saved": 0,
        "created_on_time": 1_700_000_000 + id
    })
}

/// Mounts the read-side Fever endpoints: groups, feeds, one item page, and
/// the two id lists. The bare `?api` validation call is answered by a
/// catch-all, which must therefore be mounted after everything else.
async fn mount_fever_backend(server: &MockServer, unread_ids: &str, saved_ids: &str) {
    Mock::given(method("POST"))
        .and(query_param("groups", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "api_version": 3,
            "auth": 1,
            "groups": [{"id": 1, "title": "Tech"}],
            "feeds_groups": [{"group_id": 1, "feed_ids": "10"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(query_param("feeds", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "api_version": 3,
            "auth": 1,
            "feeds": [{
                "id": 10,
                "title": "Example Feed",
                "url": "https://example.com/rss",
                "site_url": "https://example.com"
            }],
            "feeds_groups": [{"group_id": 1, "feed_ids": "10"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(query_param("items", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "api_version": 3,
            "auth": 1,
            "items": [fever_item(101, "First"), fever_item(102, "Second")]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(query_param("unread_item_ids", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "api_version": 3,
            "auth": 1,
            "unread_item_ids": unread_ids
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(query_param("saved_item_ids", ""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "api_version": 3,
            "auth": 1,
            "saved_item_ids": saved_ids
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fever_auth_doc()))
        .mount(server)
        .await;
}

async fn fever_account(db: &Database, server: &MockServer) -> Account {
    let id = db
        .insert_account(
            "Fever",
            AccountKind::Fever,
            Some(&format!("{}/fever.php", server.uri())),
            Some("alice"),
            Some("hunter2"),
        )
        .await
        .unwrap();
    account(db, id).await
}

#[tokio::test]
async fn test_fever_first_sync_mirrors_tree_and_rebuilds_state() {
    let server = MockServer::start().await;
    mount_fever_backend(&server, "101", "102").await;

    let db = test_db().await;
    let acct = fever_account(&db, &server).await;

    let summary = sync_account(&db, &client(), &acct, false).await.unwrap();
    assert_eq!(summary.folders, 1);
    assert_eq!(summary.feeds, 1);
    assert_eq!(summary.items_inserted, 2);
    assert_eq!(summary.marks_pushed, 0);

    let folders = db.list_folders(acct.id).await.unwrap();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].name, "Tech");
    assert_eq!(folders[0].remote_id.as_deref(), Some("1"));

    let feeds = db.list_feeds(acct.id, true).await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].name, "Example Feed");
    assert_eq!(feeds[0].remote_id.as_deref(), Some("10"));
    assert_eq!(feeds[0].folder_id, Some(folders[0].id));
    assert_eq!(feeds[0].unread_count, 1);

    // Watermark advances to the highest item id seen.
    let acct = account(&db, acct.id).await;
    assert_eq!(acct.last_modified, 102);

    // The id lists said: 101 unread, 102 saved (and therefore read).
    assert_eq!(titles(&db, &acct, MainFilter::All, false).await, vec!["First"]);
    assert_eq!(
        titles(&db, &acct, MainFilter::Stars, true).await,
        vec!["Second"]
    );
}

#[tokio::test]
async fn test_fever_second_sync_pushes_marks_and_applies_server_state() {
    let server = MockServer::start().await;
    mount_fever_backend(&server, "101", "102").await;

    let db = test_db().await;
    let acct = fever_account(&db, &server).await;
    sync_account(&db, &client(), &acct, false).await.unwrap();
    let acct = account(&db, acct.id).await;

    // Mark 101 read and unsave 102 locally.
    let filters = QueryFilters {
        account_id: acct.id,
        ..QueryFilters::default()
    };
    let sql = build_items_query(&filters, true).unwrap();
    let rows = db.query_items(&sql).await.unwrap();
    let first = rows.iter().find(|r| r.remote_id == "101").unwrap();
    let second = rows.iter().find(|r| r.remote_id == "102").unwrap();
    assert!(db.set_item_read(first.id, true, &acct).await.unwrap());
    assert!(db.set_item_starred(second.id, false, &acct).await.unwrap());
    assert_eq!(db.read_changes(&acct).await.unwrap().len(), 1);
    assert_eq!(db.starred_changes(&acct).await.unwrap().len(), 1);

    // Second phase: the server expects one mark call per pending change
    // and serves id lists that already reflect them.
    server.reset().await;
    Mock::given(method("POST"))
        .and(query_param("mark", "item"))
        .and(query_param("as", "read"))
        .and(query_param("id", "101"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fever_auth_doc()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(query_param("mark", "item"))
        .and(query_param("as", "unsaved"))
        .and(query_param("id", "102"))
        .respond_with(ResponseTemplate::new(200).set_body_json(fever_auth_doc()))
        .expect(1)
        .mount(&server)
        .await;
    mount_fever_backend(&server, "", "").await;

    let summary = sync_account(&db, &client(), &acct, false).await.unwrap();
    assert_eq!(summary.marks_pushed, 2);
    assert_eq!(summary.items_inserted, 0, "rerun must not duplicate items");

    // Pending flags are gone and the rebuilt state matches the lists.
    let acct = account(&db, acct.id).await;
    assert!(db.read_changes(&acct).await.unwrap().is_empty());
    assert!(db.starred_changes(&acct).await.unwrap().is_empty());
    assert!(titles(&db, &acct, MainFilter::All, false).await.is_empty());
    assert!(titles(&db, &acct, MainFilter::Stars, true).await.is_empty());
    assert_eq!(acct.last_modified, 102);
}

#[tokio::test]
async fn test_fever_rejected_api_key_fails_the_sync_before_any_write() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"api_version": 3, "auth": 0})),
        )
        .mount(&server)
        .await;

    let db = test_db().await;
    let acct = fever_account(&db, &server).await;

    let err = sync_account(&db, &client(), &acct, false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::Auth(_))
    ));
    assert!(db.list_folders(acct.id).await.unwrap().is_empty());
    assert!(db.list_feeds(acct.id, true).await.unwrap().is_empty());
}

// ============================================================================
// FreshRSS
// ============================================================================

fn reader_item(suffix: &str, title: &str, published: i64, read: bool, starred: bool) -> serde_json::Value {
    let mut categories = vec!["user/-/state/com.google/reading-list".to_string()];
    if read {
        categories.push("user/-/state/com.google/read".to_string());
    }
    if starred {
        categories.push("user/-/state/com.google/starred".to_string());
    }
    json!({
        "id": format!("tag:google.com,2005:reader/item/{suffix}"),
        "published": published,
        "title": title,
        "summary": {"content": format!("<p>{title}</p>")},
        "alternate": [{"href": format!("https://example.com/{suffix}"), "type": "text/html"}],
        "categories": categories,
        "origin": {"streamId": "feed/12", "title": "Example Feed"},
        "author": "Carol"
    })
}

/// Mounts the read-side Reader endpoints for one session token. ClientLogin
/// and edit-tag are left to each test.
async fn mount_reader_backend(
    server: &MockServer,
    token: &str,
    write_token: &str,
    reading_list: serde_json::Value,
) {
    let auth = format!("GoogleLogin auth={token}");
    Mock::given(method("GET"))
        .and(path("/reader/api/0/user-info"))
        .and(header("Authorization", auth.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"userName": "carol"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/reader/api/0/token"))
        .and(header("Authorization", auth.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string(write_token))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/reader/api/0/tag/list"))
        .and(query_param("output", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tags": [
                {"id": "user/-/state/com.google/starred"},
                {"id": "user/-/label/Tech", "type": "folder"}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/reader/api/0/subscription/list"))
        .and(query_param("output", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "subscriptions": [{
                "id": "feed/12",
                "title": "Example Feed",
                "categories": [{"id": "user/-/label/Tech", "label": "Tech"}],
                "url": "https://example.com/rss",
                "htmlUrl": "https://example.com"
            }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(
            "/reader/api/0/stream/contents/user/-/state/com.google/reading-list",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(reading_list))
        .mount(server)
        .await;
}

async fn freshrss_account(db: &Database, server: &MockServer) -> Account {
    let id = db
        .insert_account(
            "Fresh",
            AccountKind::FreshRss,
            Some(&server.uri()),
            Some("carol@example.com"),
            Some("hunter2"),
        )
        .await
        .unwrap();
    account(db, id).await
}

#[tokio::test]
async fn test_freshrss_first_sync_logs_in_and_merges_the_starred_backlog() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/ClientLogin"))
        .and(body_string_contains("Email=carol%40example.com"))
        .and(body_string_contains("Passwd=hunter2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("SID=null\nLSID=null\nAuth=carol/tok1\n"),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_reader_backend(
        &server,
        "carol/tok1",
        "wtok1",
        json!({"items": [
            reader_item("0001", "First", 1_700_000_000, true, false),
            reader_item("0002", "Second", 1_700_000_100, false, false)
        ]}),
    )
    .await;
    // Only the first sync pulls the starred stream.
    Mock::given(method("GET"))
        .and(path(
            "/reader/api/0/stream/contents/user/-/state/com.google/starred",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
            reader_item("0003", "Old Favorite", 1_600_000_000, true, true)
        ]})))
        .expect(1)
        .mount(&server)
        .await;

    let db = test_db().await;
    let acct = freshrss_account(&db, &server).await;

    let summary = sync_account(&db, &client(), &acct, false).await.unwrap();
    assert_eq!(summary.folders, 1);
    assert_eq!(summary.feeds, 1);
    assert_eq!(summary.items_inserted, 3);
    assert_eq!(summary.marks_pushed, 0);

    // Session artifacts are persisted and the account adopts the server
    // user name.
    let acct = account(&db, acct.id).await;
    assert_eq!(acct.name, "carol");
    assert_eq!(acct.token.as_deref(), Some("carol/tok1"));
    assert_eq!(acct.write_token.as_deref(), Some("wtok1"));
    assert!(acct.last_modified > 0, "watermark must move off zero");

    let folders = db.list_folders(acct.id).await.unwrap();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].name, "Tech");

    let feeds = db.list_feeds(acct.id, false).await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].name, "Example Feed");
    assert_eq!(feeds[0].folder_id, Some(folders[0].id));
    assert_eq!(feeds[0].unread_count, 1);

    assert_eq!(
        titles(&db, &acct, MainFilter::All, false).await,
        vec!["Second"]
    );
    assert_eq!(
        titles(&db, &acct, MainFilter::Stars, true).await,
        vec!["Old Favorite"]
    );
}

#[tokio::test]
async fn test_freshrss_second_sync_reuses_the_token_and_pushes_marks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/ClientLogin"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("SID=null\nLSID=null\nAuth=carol/tok1\n"),
        )
        .mount(&server)
        .await;
    mount_reader_backend(
        &server,
        "carol/tok1",
        "wtok1",
        json!({"items": [
            reader_item("0001", "First", 1_700_000_000, true, false),
            reader_item("0002", "Second", 1_700_000_100, false, false)
        ]}),
    )
    .await;
    Mock::given(method("GET"))
        .and(path(
            "/reader/api/0/stream/contents/user/-/state/com.google/starred",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    let db = test_db().await;
    let acct = freshrss_account(&db, &server).await;
    sync_account(&db, &client(), &acct, false).await.unwrap();
    let acct = account(&db, acct.id).await;
    let watermark = acct.last_modified;

    // Mark "Second" read locally; the change is pending until pushed.
    let filters = QueryFilters {
        account_id: acct.id,
        ..QueryFilters::default()
    };
    let sql = build_items_query(&filters, false).unwrap();
    let rows = db.query_items(&sql).await.unwrap();
    let second = rows.iter().find(|r| r.title == "Second").unwrap();
    assert!(db.set_item_read(second.id, true, &acct).await.unwrap());

    // Second phase: no ClientLogin mock, so only a reused token can work.
    // The pending mark must arrive as one edit-tag call carrying the fresh
    // write token.
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/reader/api/0/edit-tag"))
        .and(body_string_contains("i=tag%3Agoogle.com%2C2005%3Areader%2Fitem%2F0002"))
        .and(body_string_contains("a=user%2F-%2Fstate%2Fcom.google%2Fread"))
        .and(body_string_contains("T=wtok2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;
    mount_reader_backend(
        &server,
        "carol/tok1",
        "wtok2",
        json!({"items": [
            reader_item("0002", "Second", 1_700_000_100, true, false)
        ]}),
    )
    .await;

    let summary = sync_account(&db, &client(), &acct, false).await.unwrap();
    assert_eq!(summary.marks_pushed, 1);
    assert_eq!(summary.items_inserted, 0);

    let acct = account(&db, acct.id).await;
    assert_eq!(acct.write_token.as_deref(), Some("wtok2"));
    assert!(
        acct.last_modified >= watermark,
        "watermark must not move backwards"
    );
    assert!(db.read_changes(&acct).await.unwrap().is_empty());
    assert!(titles(&db, &acct, MainFilter::All, false).await.is_empty());
}

#[tokio::test]
async fn test_freshrss_logs_in_again_when_the_stored_token_is_stale() {
    let server = MockServer::start().await;
    // The stale token is rejected; everything else works with the new one.
    Mock::given(method("GET"))
        .and(path("/reader/api/0/user-info"))
        .and(header("Authorization", "GoogleLogin auth=stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/accounts/ClientLogin"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("SID=null\nLSID=null\nAuth=carol/tok9\n"),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_reader_backend(&server, "carol/tok9", "wtok9", json!({"items": []})).await;
    Mock::given(method("GET"))
        .and(path(
            "/reader/api/0/stream/contents/user/-/state/com.google/starred",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    let db = test_db().await;
    let acct = freshrss_account(&db, &server).await;
    db.update_account_token(acct.id, "stale").await.unwrap();
    let acct = account(&db, acct.id).await;

    sync_account(&db, &client(), &acct, false).await.unwrap();

    let acct = account(&db, acct.id).await;
    assert_eq!(acct.token.as_deref(), Some("carol/tok9"));
    assert_eq!(acct.write_token.as_deref(), Some("wtok9"));
}
