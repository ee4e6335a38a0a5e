//! Request list persistence and restart behavior.

use std::sync::Arc;

use dragnet::storage::KeyValueStore;
use dragnet::{MemoryKeyValueStore, Request, RequestList, RequestListOptions, RequestListSource};

fn seeds(urls: &[&str]) -> Vec<RequestListSource> {
    vec![RequestListSource::Requests(
        urls.iter().map(|u| Request::new(*u).unwrap()).collect(),
    )]
}

fn persisted_options(store: &Arc<dyn KeyValueStore>) -> RequestListOptions {
    RequestListOptions {
        keep_duplicates: false,
        persist_state_key: Some("list-state".to_string()),
        store: Some(Arc::clone(store)),
    }
}

#[tokio::test]
async fn restart_reserves_in_progress_first_and_skips_handled() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let urls = ["https://a.test/", "https://b.test/", "https://c.test/"];

    {
        let list = RequestList::open(seeds(&urls), persisted_options(&store))
            .await
            .unwrap();
        let a = list.fetch_next_request().await.unwrap();
        let _b = list.fetch_next_request().await.unwrap(); // stays in flight
        list.mark_request_handled(&a).await.unwrap();
        list.persist_state().await.unwrap();
    }

    // Restart: b was in progress, so it is re-served first; a is gone
    let restarted = RequestList::open(seeds(&urls), persisted_options(&store))
        .await
        .unwrap();
    let first = restarted.fetch_next_request().await.unwrap();
    assert_eq!(first.url, "https://b.test/");
    let second = restarted.fetch_next_request().await.unwrap();
    assert_eq!(second.url, "https://c.test/");
    assert!(restarted.fetch_next_request().await.is_none());
}

#[tokio::test]
async fn restart_preserves_reclaimed_requests_with_retry_state() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let urls = ["https://a.test/", "https://b.test/"];

    {
        let list = RequestList::open(seeds(&urls), persisted_options(&store))
            .await
            .unwrap();
        let mut a = list.fetch_next_request().await.unwrap();
        a.retry_count = 2;
        a.push_error_message("first failure");
        list.reclaim_request(&a).await.unwrap();
        list.persist_state().await.unwrap();
    }

    let restarted = RequestList::open(seeds(&urls), persisted_options(&store))
        .await
        .unwrap();
    let reclaimed = restarted.fetch_next_request().await.unwrap();
    assert_eq!(reclaimed.url, "https://a.test/");
    assert_eq!(reclaimed.retry_count, 2);
    assert_eq!(reclaimed.error_messages, vec!["first failure".to_string()]);
}

#[tokio::test]
async fn persist_without_store_is_a_noop() {
    let list = RequestList::open(seeds(&["https://a.test/"]), RequestListOptions::default())
        .await
        .unwrap();
    list.persist_state().await.unwrap();
}
