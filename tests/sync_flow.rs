//! End-to-end scenarios: controllers, loaders, observer surface, and
//! reconnect recovery wired together against the in-memory store and the
//! scripted remote.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use time::OffsetDateTime;

use estuary::cache::{LocalStore, MemoryStore, StoreTransaction};
use estuary::controller::{ControllerState, ListControllerDelegate, ListEvent};
use estuary::model::{Channel, ChannelId, ChannelListQuery, ChannelSort, Message, MessageId, UserId};
use estuary::observer::ListChangeBatch;
use estuary::remote::payload::{ChannelPayload, MessagePayload};
use estuary::remote::{RecordedRequest, RemoteUpdater, StubRemote};
use estuary::{ChatClient, SyncConfig};

fn ts(n: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(n).unwrap()
}

fn channel_payload(id: &str, last_message: i64) -> ChannelPayload {
    ChannelPayload {
        id: id.into(),
        name: Some(id.to_uppercase()),
        created_at: ts(1),
        last_message_at: Some(ts(last_message)),
        member_count: 2,
        extra: Default::default(),
    }
}

fn message_payload(id: &str, created: i64) -> MessagePayload {
    MessagePayload {
        id: id.into(),
        channel_id: "c1".into(),
        author_id: "u1".into(),
        text: format!("text-{id}"),
        created_at: ts(created),
        updated_at: None,
        parent_id: None,
        extra: Default::default(),
    }
}

fn client() -> (ChatClient, Arc<MemoryStore>, Arc<StubRemote>) {
    client_with(SyncConfig {
        retry_delay: Duration::ZERO,
        ..SyncConfig::default()
    })
}

fn client_with(config: SyncConfig) -> (ChatClient, Arc<MemoryStore>, Arc<StubRemote>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(StubRemote::new());
    let client = ChatClient::new(
        UserId::from("me"),
        Arc::clone(&store) as Arc<dyn LocalStore>,
        Arc::clone(&remote) as Arc<dyn RemoteUpdater>,
        config,
    );
    (client, store, remote)
}

fn list_query() -> ChannelListQuery {
    ChannelListQuery::new(
        serde_json::json!({"members": ["me"]}),
        ChannelSort::default(),
        20,
    )
}

#[derive(Default)]
struct RecordingDelegate {
    states: Mutex<Vec<ControllerState>>,
    batches: Mutex<usize>,
}

impl<T> ListControllerDelegate<T> for RecordingDelegate {
    fn did_change_items(&self, _batch: &ListChangeBatch<T>) {
        *self.batches.lock() += 1;
    }

    fn did_change_state(&self, state: ControllerState) {
        self.states.lock().push(state);
    }
}

#[tokio::test]
async fn channel_list_walks_its_states_and_surfaces_remote_pages() {
    let (client, _store, remote) = client();
    remote.enqueue_channels(Ok(vec![
        channel_payload("c2", 200),
        channel_payload("c1", 100),
    ]));

    let controller = client.channel_list_controller(list_query());
    let delegate = Arc::new(RecordingDelegate::default());
    controller.add_delegate(Arc::clone(&delegate) as Arc<dyn ListControllerDelegate<Channel>>);

    assert_eq!(controller.state(), ControllerState::Initialized);
    controller.synchronize().await.unwrap();
    assert_eq!(controller.state(), ControllerState::RemoteDataFetched);
    assert_eq!(
        *delegate.states.lock(),
        vec![
            ControllerState::LocalDataFetched,
            ControllerState::RemoteDataFetched,
        ]
    );

    let channels = controller.channels();
    let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["c2", "c1"]);
}

#[tokio::test]
async fn store_writes_flow_to_the_event_stream() {
    let (client, store, remote) = client();
    remote.enqueue_channels(Ok(vec![channel_payload("c1", 100)]));

    let controller = client.channel_list_controller(list_query());
    let mut events = controller.events();
    controller.synchronize().await.unwrap();

    // A later write that adds a member to the observed query must surface as
    // an item batch on the stream.
    store
        .write(
            StoreTransaction::new()
                .upsert_channels(vec![Channel {
                    id: ChannelId::from("c9"),
                    name: None,
                    created_at: ts(1),
                    last_message_at: Some(ts(900)),
                    member_count: 2,
                    extra: Default::default(),
                }])
                .link_query(list_query().cache_key(), vec![ChannelId::from("c9")]),
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for the c9 batch");
        let event = tokio::time::timeout(remaining, events.next())
            .await
            .expect("stream timed out")
            .expect("stream closed");
        if let ListEvent::Items(batch) = event {
            if batch_mentions(&batch, "c9") {
                break;
            }
        }
    }
}

fn batch_mentions(batch: &ListChangeBatch<Channel>, id: &str) -> bool {
    match batch {
        ListChangeBatch::Changes(ops) => ops.iter().any(|op| match op {
            estuary::observer::ListChange::Insert { item, .. }
            | estuary::observer::ListChange::Update { item, .. }
            | estuary::observer::ListChange::Remove { item, .. }
            | estuary::observer::ListChange::Move { item, .. } => item.id.as_str() == id,
        }),
        ListChangeBatch::Reload(items) => items.iter().any(|item| item.id.as_str() == id),
    }
}

#[tokio::test]
async fn message_timeline_paginates_backwards_through_the_controller() {
    let (client, _store, remote) = client_with(SyncConfig {
        message_page_size: 2,
        retry_delay: Duration::ZERO,
        ..SyncConfig::default()
    });
    remote.enqueue_messages(Ok(vec![
        message_payload("m4", 40),
        message_payload("m3", 30),
    ]));

    let controller = client.channel_controller(ChannelId::from("c1"));
    controller.synchronize().await.unwrap();
    assert_eq!(controller.state(), ControllerState::RemoteDataFetched);

    remote.enqueue_messages(Ok(vec![
        message_payload("m2", 20),
        message_payload("m1", 10),
    ]));
    controller
        .load_previous_messages(None, Some(2))
        .await
        .unwrap();

    let messages = controller.messages();
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);

    // The backward request anchored on the oldest fetched message.
    let requests = remote.requests();
    match &requests[1] {
        RecordedRequest::Messages { page, .. } => {
            assert_eq!(
                page.param(),
                Some(&estuary::protocol::PageParam::LessThan("m3".into()))
            );
        }
        other => panic!("expected messages request, got {other:?}"),
    }

    // A first-page load always pins the newest edge.
    assert!(controller.has_loaded_all_next_messages());
    assert!(!controller.has_loaded_all_previous_messages());
}

#[tokio::test]
async fn failed_remote_synchronize_reports_failed_state_but_keeps_local_data() {
    let (client, store, remote) = client();
    store
        .write(StoreTransaction::new().upsert_messages(vec![Message {
            id: MessageId::from("m-local"),
            channel_id: ChannelId::from("c1"),
            author: UserId::from("me"),
            text: "draft".into(),
            created_at: ts(5),
            updated_at: ts(5),
            parent_id: None,
            extra: Default::default(),
        }]))
        .await
        .unwrap();
    remote.enqueue_messages(Err(estuary::remote::RemoteError::Transport(
        "offline".into(),
    )));

    let controller = client.channel_controller(ChannelId::from("c1"));
    let err = controller.synchronize().await.unwrap_err();
    assert!(matches!(err, estuary::ClientError::Remote(_)));
    assert_eq!(controller.state(), ControllerState::RemoteDataFetchFailed);
}

#[tokio::test]
async fn reconnect_recovery_spans_active_controllers() {
    let (client, store, remote) = client();

    // One channel on screen, one list query bound.
    remote.enqueue_messages(Ok(vec![message_payload("m1", 10)]));
    let channel = client.channel_controller(ChannelId::from("c1"));
    channel.synchronize().await.unwrap();

    remote.enqueue_channels(Ok(vec![channel_payload("c1", 100)]));
    let list = client.channel_list_controller(list_query());
    list.synchronize().await.unwrap();

    // Another channel known locally but not on screen.
    store
        .write(StoreTransaction::new().upsert_channels(vec![Channel {
            id: ChannelId::from("c-background"),
            name: None,
            created_at: ts(1),
            last_message_at: None,
            member_count: 1,
            extra: Default::default(),
        }]))
        .await
        .unwrap();
    store
        .write(StoreTransaction::new().set_last_sync_at(UserId::from("me"), ts(1000)))
        .await
        .unwrap();

    remote.enqueue_sync(Ok(vec![ChannelId::from("c1")]));
    remote.enqueue_channels(Ok(vec![channel_payload("c1", 100)]));

    let coordinator = client.recovery_coordinator();
    let cx = coordinator.run(None).await;

    // c1 was replayed by the server, so the on-screen channel is not watched
    // again; the background channel was never on screen at all.
    assert!(cx.synced_channel_ids.contains(&ChannelId::from("c1")));
    assert!(
        !fx_watched(&remote).contains(&"c1".to_string()),
        "replayed channel must not be re-watched"
    );
    assert!(cx.local_channel_ids.contains(&ChannelId::from("c-background")));
}

fn fx_watched(remote: &StubRemote) -> Vec<String> {
    remote
        .requests()
        .iter()
        .filter_map(|r| match r {
            RecordedRequest::Watch { channel } => Some(channel.0.clone()),
            _ => None,
        })
        .collect()
}
