//! Test suite for the keyed store client and the advisory lock.
//!
//! Everything except the live smoke test runs against [`MemoryBackend`],
//! which reproduces the store's pagination, conditional-write, and
//! partial-batch-failure behavior in process, with call counters and fault
//! injection. The smoke test at the bottom drives the real SDK backend and
//! needs a reachable DynamoDB endpoint:
//!
//! ```
//! AWS_ACCESS_KEY_ID=dummy
//! AWS_SECRET_ACCESS_KEY=dummy
//! AWS_REGION=us-east-1
//! AWS_ENDPOINT_URL=http://localhost:8000
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aws_sdk_dynamodb::types::AttributeValue;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::StoreError;
use crate::lock::{self, with_lock, LockError, LockStatus};
use crate::store::{
    assignments, token, Condition, Item, MemoryBackend, QueryParams, ScanParams, StoreClient,
    TransactPut, UpdateExpression, UpdateParams,
};

const SESSIONS: &str = "sessions";
const EVENTS: &str = "events";
const USERS: &str = "users";
const LOCKS: &str = "locks";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    id: String,
    val: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Event {
    stream: String,
    seq: i32,
    payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: String,
    val: i32,
}

fn store_over(backend: MemoryBackend) -> (StoreClient, Arc<MemoryBackend>) {
    let backend = Arc::new(backend);
    (StoreClient::with_backend(backend.clone()), backend)
}

fn sessions_backend() -> MemoryBackend {
    MemoryBackend::new().with_table(SESSIONS, "id", None)
}

fn events_backend() -> MemoryBackend {
    MemoryBackend::new().with_table(EVENTS, "stream", Some("seq"))
}

fn seed_events(backend: &MemoryBackend, stream: &str, count: i32) -> Result<()> {
    backend.seed(
        EVENTS,
        (1..=count).map(|seq| {
            Item::new()
                .set_string("stream", stream)
                .set_number("seq", seq)
                .set_string("payload", format!("payload-{seq}"))
        }),
    )?;
    Ok(())
}

fn stream_query(stream: &str) -> QueryParams {
    QueryParams {
        table: EVENTS.to_owned(),
        key_condition: "stream = :stream".to_owned(),
        values: [(
            ":stream".to_owned(),
            AttributeValue::S(stream.to_owned()),
        )]
        .into(),
        ..QueryParams::default()
    }
}

// --- Point operations ---

#[tokio::test]
async fn crud_roundtrip() -> Result<()> {
    let (store, _) = store_over(sessions_backend());
    let session = Session {
        id: "a".to_owned(),
        val: 1,
    };

    store.put(SESSIONS, &session, None).await?;
    let fetched: Option<Session> = store
        .get(SESSIONS, Item::new().set_string("id", "a"))
        .await?;
    assert_eq!(fetched, Some(session));

    assert!(store.delete(SESSIONS, Item::new().set_string("id", "a")).await?);
    let fetched: Option<Session> = store
        .get(SESSIONS, Item::new().set_string("id", "a"))
        .await?;
    assert_eq!(fetched, None);

    // Deleting again is idempotent and reports that nothing existed.
    assert!(!store.delete(SESSIONS, Item::new().set_string("id", "a")).await?);
    Ok(())
}

#[tokio::test]
async fn conditional_put_guards_existing_items() -> Result<()> {
    let (store, _) = store_over(sessions_backend());
    let session = Session {
        id: "a".to_owned(),
        val: 1,
    };
    let if_absent = || Some(Condition::new("attribute_not_exists(#id)").name("#id", "id"));

    store.put(SESSIONS, &session, if_absent()).await?;
    let second = store.put(SESSIONS, &session, if_absent()).await;
    assert!(matches!(second, Err(StoreError::ConditionFailed)));
    Ok(())
}

#[tokio::test]
async fn conditional_update_on_existing_item_fails() -> Result<()> {
    let (store, _) = store_over(sessions_backend());
    store
        .put(
            SESSIONS,
            &Session {
                id: "a".to_owned(),
                val: 1,
            },
            None,
        )
        .await?;

    let result = store
        .update(UpdateParams {
            table: SESSIONS.to_owned(),
            key: Item::new().set_string("id", "a"),
            update: UpdateExpression::set("#val = :val"),
            names: [("#val".to_owned(), "val".to_owned())].into(),
            values: [(":val".to_owned(), AttributeValue::N("2".to_owned()))].into(),
            condition: Some("attribute_not_exists(id)".to_owned()),
        })
        .await;
    assert!(matches!(result, Err(StoreError::ConditionFailed)));
    Ok(())
}

#[tokio::test]
async fn update_returns_post_update_item() -> Result<()> {
    let (store, _) = store_over(sessions_backend());
    store
        .put(
            SESSIONS,
            &Session {
                id: "a".to_owned(),
                val: 5,
            },
            None,
        )
        .await?;

    let updated = store
        .update(UpdateParams {
            table: SESSIONS.to_owned(),
            key: Item::new().set_string("id", "a"),
            update: UpdateExpression {
                add: vec!["#val :delta".to_owned()],
                ..UpdateExpression::default()
            },
            names: [("#val".to_owned(), "val".to_owned())].into(),
            values: [(":delta".to_owned(), AttributeValue::N("3".to_owned()))].into(),
            condition: None,
        })
        .await?;
    assert_eq!(updated.get_number("val"), Some(8.0));
    Ok(())
}

// --- Queries and pagination ---

#[tokio::test]
async fn query_limit_returns_token_and_resumes() -> Result<()> {
    let (store, backend) = store_over(events_backend());
    seed_events(&backend, "s1", 20)?;

    let params = QueryParams {
        limit: Some(5),
        ..stream_query("s1")
    };
    let first: crate::store::QueryOutput<Event> = store.query(params.clone()).await?;
    assert_eq!(
        first.items.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    let token = first
        .next_pagination_token
        .expect("a page boundary must yield a token");

    let second: crate::store::QueryOutput<Event> = store
        .query(QueryParams {
            pagination_token: Some(token),
            ..params
        })
        .await?;
    assert_eq!(
        second.items.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![6, 7, 8, 9, 10]
    );
    assert!(second.next_pagination_token.is_some());
    Ok(())
}

#[tokio::test]
async fn query_all_chains_pages_and_is_idempotent() -> Result<()> {
    let (store, backend) = store_over(events_backend().with_page_size(7));
    seed_events(&backend, "s1", 20)?;

    let first: Vec<Event> = store.query_all(stream_query("s1")).await?;
    let second: Vec<Event> = store.query_all(stream_query("s1")).await?;

    assert_eq!(first.len(), 20);
    assert_eq!(first, second);
    assert_eq!(
        first.iter().map(|e| e.seq).collect::<Vec<_>>(),
        (1..=20).collect::<Vec<_>>()
    );
    // 20 items in pages of 7 is three underlying requests per pass.
    assert_eq!(backend.page_calls(), 6);
    Ok(())
}

#[tokio::test]
async fn query_descending_reverses_key_order() -> Result<()> {
    let (store, backend) = store_over(events_backend());
    seed_events(&backend, "s1", 5)?;

    let output: crate::store::QueryOutput<Event> = store
        .query(QueryParams {
            scan_forward: Some(false),
            ..stream_query("s1")
        })
        .await?;
    assert_eq!(
        output.items.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![5, 4, 3, 2, 1]
    );
    Ok(())
}

#[tokio::test]
async fn query_filter_drops_non_matching_items() -> Result<()> {
    let (store, backend) = store_over(events_backend());
    seed_events(&backend, "s1", 10)?;

    let mut params = stream_query("s1");
    params.filter = Some("payload = :p".to_owned());
    params
        .values
        .insert(":p".to_owned(), AttributeValue::S("payload-7".to_owned()));

    let output: crate::store::QueryOutput<Event> = store.query(params).await?;
    assert_eq!(output.items.len(), 1);
    assert_eq!(output.items[0].seq, 7);
    Ok(())
}

#[tokio::test]
async fn count_totals_across_pages_without_items() -> Result<()> {
    let (store, backend) = store_over(events_backend().with_page_size(7));
    seed_events(&backend, "s1", 20)?;

    assert_eq!(store.count(stream_query("s1")).await?, 20);
    assert_eq!(backend.page_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn scan_pages_round_trip_through_tokens() -> Result<()> {
    let (store, backend) = store_over(events_backend().with_page_size(8));
    seed_events(&backend, "s1", 20)?;

    let params = ScanParams {
        table: EVENTS.to_owned(),
        ..ScanParams::default()
    };
    let mut seen = 0;
    let mut pagination_token = None;
    let mut pages = 0;
    loop {
        let output: crate::store::QueryOutput<Event> = store
            .scan(ScanParams {
                pagination_token: pagination_token.take(),
                ..params.clone()
            })
            .await?;
        seen += output.items.len();
        pages += 1;
        pagination_token = output.next_pagination_token;
        if pagination_token.is_none() {
            break;
        }
    }
    assert_eq!(seen, 20);
    assert_eq!(pages, 3);
    Ok(())
}

#[tokio::test]
async fn scan_all_drains_the_table() -> Result<()> {
    let (store, backend) = store_over(events_backend().with_page_size(6));
    seed_events(&backend, "s1", 9)?;
    seed_events(&backend, "s2", 6)?;

    let items: Vec<Event> = store
        .scan_all(ScanParams {
            table: EVENTS.to_owned(),
            ..ScanParams::default()
        })
        .await?;
    assert_eq!(items.len(), 15);
    Ok(())
}

#[tokio::test]
async fn malformed_pagination_token_fails_before_any_request() -> Result<()> {
    let (store, backend) = store_over(events_backend());

    for bad_token in ["not base64!!!", "aGVsbG8="] {
        let result: Result<crate::store::QueryOutput<Event>, _> = store
            .query(QueryParams {
                pagination_token: Some(bad_token.to_owned()),
                ..stream_query("s1")
            })
            .await;
        assert!(matches!(result, Err(StoreError::InvalidPaginationToken)));
    }
    assert_eq!(backend.page_calls(), 0);
    Ok(())
}

#[test]
fn pagination_token_round_trips_cursor() -> Result<()> {
    let cursor = Item::new()
        .set_string("stream", "s1")
        .set_number("seq", 17)
        .into_attributes();
    let encoded = token::encode(&cursor)?;
    assert_eq!(token::decode(&encoded)?, cursor);
    Ok(())
}

// --- Batched reads ---

#[tokio::test]
async fn batch_get_chunks_transparently() -> Result<()> {
    let backend = MemoryBackend::new().with_table(USERS, "id", None);
    backend.seed(
        USERS,
        (0..250).map(|i| {
            Item::new()
                .set_string("id", format!("u{i}"))
                .set_number("val", i)
        }),
    )?;
    let (store, backend) = store_over(backend);

    // 250 present keys plus 10 that match nothing.
    let keys: Vec<Item> = (0..260)
        .map(|i| Item::new().set_string("id", format!("u{i}")))
        .collect();
    let users: Vec<User> = store.batch_get(USERS, keys, false).await?;

    assert_eq!(users.len(), 250);
    assert_eq!(backend.batch_get_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn batch_get_requeues_unprocessed_keys() -> Result<()> {
    let backend = MemoryBackend::new().with_table(USERS, "id", None);
    backend.seed(
        USERS,
        (0..50).map(|i| {
            Item::new()
                .set_string("id", format!("u{i}"))
                .set_number("val", i)
        }),
    )?;
    backend.fail_batch_gets(1);
    let (store, backend) = store_over(backend);

    let keys: Vec<Item> = (0..50)
        .map(|i| Item::new().set_string("id", format!("u{i}")))
        .collect();
    let users: Vec<User> = store.batch_get(USERS, keys, false).await?;

    assert_eq!(users.len(), 50);
    assert_eq!(backend.batch_get_calls(), 2);
    Ok(())
}

#[tokio::test]
async fn batch_get_rejects_compound_keys() -> Result<()> {
    let (store, backend) = store_over(events_backend());
    let compound = Item::new().set_string("stream", "s1").set_number("seq", 1);
    let result: Result<Vec<Event>, _> = store.batch_get(EVENTS, vec![compound], false).await;
    assert!(matches!(result, Err(StoreError::InvalidRequest(_))));
    assert_eq!(backend.batch_get_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn batch_get_with_no_keys_is_a_noop() -> Result<()> {
    let (store, backend) = store_over(sessions_backend());
    let items: Vec<Session> = store.batch_get(SESSIONS, Vec::new(), false).await?;
    assert!(items.is_empty());
    assert_eq!(backend.batch_get_calls(), 0);
    Ok(())
}

// --- Batched writes ---

fn sessions(count: i32) -> Vec<Session> {
    (0..count)
        .map(|i| Session {
            id: format!("s{i}"),
            val: i,
        })
        .collect()
}

#[tokio::test]
async fn put_items_chunks_transparently() -> Result<()> {
    let (store, backend) = store_over(sessions_backend());
    store.put_items(SESSIONS, &sessions(60)).await?;

    assert_eq!(backend.batch_put_calls(), 3);
    let fetched: Option<Session> = store
        .get(SESSIONS, Item::new().set_string("id", "s59"))
        .await?;
    assert_eq!(fetched.map(|s| s.val), Some(59));
    Ok(())
}

#[tokio::test]
async fn put_items_fails_after_exactly_three_attempts() -> Result<()> {
    let (store, backend) = store_over(sessions_backend());
    backend.fail_batch_puts(usize::MAX);

    let result = store.put_items(SESSIONS, &sessions(10)).await;
    assert!(matches!(
        result,
        Err(StoreError::MaxRetriesExceeded { attempts: 3 })
    ));
    assert_eq!(backend.batch_put_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn put_items_recovers_once_throttling_stops() -> Result<()> {
    let (store, backend) = store_over(sessions_backend());
    // The whole first pass (two chunks) comes back unprocessed.
    backend.fail_batch_puts(2);

    store.put_items(SESSIONS, &sessions(30)).await?;
    assert_eq!(backend.batch_put_calls(), 4);

    let fetched: Option<Session> = store
        .get(SESSIONS, Item::new().set_string("id", "s29"))
        .await?;
    assert!(fetched.is_some());
    Ok(())
}

// --- Transactional writes ---

#[tokio::test]
async fn transact_put_replays_in_progress_with_same_token() -> Result<()> {
    let backend = MemoryBackend::new()
        .with_table(SESSIONS, "id", None)
        .with_table(USERS, "id", None);
    backend.hold_transactions(2);
    let (store, backend) = store_over(backend);

    store
        .transact_put(
            vec![
                TransactPut {
                    table: SESSIONS.to_owned(),
                    item: Item::new()
                        .set_string("id", "a")
                        .set_number("val", 1)
                        .into_attributes(),
                },
                TransactPut {
                    table: USERS.to_owned(),
                    item: Item::new()
                        .set_string("id", "b")
                        .set_number("val", 2)
                        .into_attributes(),
                },
            ],
            None,
        )
        .await?;

    assert_eq!(backend.transact_calls(), 3);
    let tokens = backend.transact_tokens();
    assert!(tokens.windows(2).all(|pair| pair[0] == pair[1]));

    let session: Option<Session> = store
        .get(SESSIONS, Item::new().set_string("id", "a"))
        .await?;
    let user: Option<User> = store.get(USERS, Item::new().set_string("id", "b")).await?;
    assert!(session.is_some() && user.is_some());
    Ok(())
}

#[tokio::test]
async fn transact_put_gives_up_after_bounded_replays() -> Result<()> {
    let backend = MemoryBackend::new().with_table(SESSIONS, "id", None);
    backend.hold_transactions(usize::MAX);
    let (store, backend) = store_over(backend);

    let result = store
        .transact_put(
            vec![TransactPut {
                table: SESSIONS.to_owned(),
                item: Item::new().set_string("id", "a").into_attributes(),
            }],
            Some("fixed-token".to_owned()),
        )
        .await;

    assert!(matches!(result, Err(StoreError::TransactionInProgress)));
    assert_eq!(backend.transact_calls(), crate::store::TRANSACT_MAX_RETRIES);
    assert!(backend
        .transact_tokens()
        .iter()
        .all(|token| token == "fixed-token"));
    Ok(())
}

// --- Update expressions ---

#[test]
fn update_expression_renders_all_clause_kinds() {
    let expression = UpdateExpression {
        set: vec!["#a = :a".to_owned(), "#b = :b".to_owned()],
        remove: vec!["#c".to_owned()],
        add: vec!["#d :d".to_owned()],
        delete: vec!["#e :e".to_owned()],
    };
    assert_eq!(
        expression.render(),
        "SET #a = :a, #b = :b REMOVE #c ADD #d :d DELETE #e :e"
    );
}

#[test]
fn update_expression_skips_empty_clause_lists() {
    assert_eq!(UpdateExpression::set("#a = :a").render(), "SET #a = :a");
    assert_eq!(UpdateExpression::default().render(), "");
}

#[test]
fn assignments_splits_sets_and_removes() {
    let (update, names, values) = assignments(vec![
        ("title".to_owned(), Some(AttributeValue::S("t".to_owned()))),
        ("stale".to_owned(), None),
    ]);
    assert_eq!(update.set, vec!["#name0 = :value0"]);
    assert_eq!(update.remove, vec!["#name1"]);
    assert_eq!(names.get("#name0").map(String::as_str), Some("title"));
    assert_eq!(names.get("#name1").map(String::as_str), Some("stale"));
    assert_eq!(
        values.get(":value0"),
        Some(&AttributeValue::S("t".to_owned()))
    );
}

// --- Advisory lock ---

fn locks_backend() -> MemoryBackend {
    MemoryBackend::new().with_table(LOCKS, "name", None)
}

#[tokio::test]
async fn lock_is_mutually_exclusive() -> Result<()> {
    let (store, _) = store_over(locks_backend());
    let (release, held) = tokio::sync::oneshot::channel::<()>();

    let holder_store = store.clone();
    let holder = tokio::spawn(async move {
        with_lock(&holder_store, LOCKS, "job", Duration::from_secs(5), async {
            held.await.ok();
            42
        })
        .await
    });

    sleep(Duration::from_millis(100)).await;
    let contender = with_lock(&store, LOCKS, "job", Duration::from_secs(5), async { 0 }).await?;
    assert_eq!(contender, LockStatus::Taken);

    release.send(()).ok();
    assert_eq!(holder.await??, LockStatus::Acquired(42));
    Ok(())
}

#[tokio::test]
async fn lock_expired_lease_can_be_seized() -> Result<()> {
    let (store, _) = store_over(locks_backend());

    lock::take_lock(&store, LOCKS, "job", "issuer-a", Duration::from_millis(50)).await?;
    let contended =
        lock::take_lock(&store, LOCKS, "job", "issuer-b", Duration::from_millis(50)).await;
    assert!(matches!(contended, Err(StoreError::ConditionFailed)));

    // The holder crashed without releasing; after expiry the name is free.
    sleep(Duration::from_millis(80)).await;
    lock::take_lock(&store, LOCKS, "job", "issuer-b", Duration::from_millis(50)).await?;
    Ok(())
}

#[tokio::test]
async fn lock_release_allows_reacquisition() -> Result<()> {
    let (store, _) = store_over(locks_backend());

    let first = with_lock(&store, LOCKS, "job", Duration::from_secs(5), async { 1 }).await?;
    assert_eq!(first, LockStatus::Acquired(1));

    let second = with_lock(&store, LOCKS, "job", Duration::from_secs(5), async { 2 }).await?;
    assert_eq!(second, LockStatus::Acquired(2));
    Ok(())
}

#[tokio::test]
async fn lock_heartbeat_outlives_the_initial_lease() -> Result<()> {
    let (store, _) = store_over(locks_backend());

    let holder_store = store.clone();
    let holder = tokio::spawn(async move {
        with_lock(
            &holder_store,
            LOCKS,
            "job",
            Duration::from_millis(500),
            async {
                sleep(Duration::from_millis(1200)).await;
                "done"
            },
        )
        .await
    });

    // Probe well past the initial lease; the heartbeat must have extended it.
    sleep(Duration::from_millis(700)).await;
    let contender =
        with_lock(&store, LOCKS, "job", Duration::from_millis(500), async { "" }).await?;
    assert_eq!(contender, LockStatus::Taken);

    assert_eq!(holder.await??, LockStatus::Acquired("done"));
    Ok(())
}

#[tokio::test]
async fn lock_seized_lease_aborts_the_work() -> Result<()> {
    let (store, _) = store_over(locks_backend());

    let holder_store = store.clone();
    let holder = tokio::spawn(async move {
        with_lock(
            &holder_store,
            LOCKS,
            "job",
            Duration::from_millis(300),
            async {
                sleep(Duration::from_secs(5)).await;
                "never"
            },
        )
        .await
    });

    // Simulate another party stomping the lease out from under the holder.
    sleep(Duration::from_millis(50)).await;
    store
        .put_raw(
            LOCKS,
            Item::new()
                .set_string("name", "job")
                .set_string("issuer", "intruder")
                .set_number("expires_at", i64::MAX),
            None,
        )
        .await?;

    assert!(matches!(holder.await?, Err(LockError::Lost)));
    Ok(())
}

// --- Live smoke test ---

/// Exercises the real SDK backend end to end. Needs credentials and an
/// existing table `dynamo-store-smoke` with string partition key `id`.
#[tokio::test]
#[ignore = "requires a live DynamoDB endpoint"]
async fn live_smoke() -> Result<()> {
    dotenv::dotenv().ok();
    let store = StoreClient::from_env().await;
    let key = || Item::new().set_string("id", "smoke");

    store
        .put_raw(
            "dynamo-store-smoke",
            key().set_number("val", 1),
            None,
        )
        .await?;
    assert!(store.get_raw("dynamo-store-smoke", key()).await?.is_some());
    assert!(store.delete("dynamo-store-smoke", key()).await?);
    Ok(())
}
