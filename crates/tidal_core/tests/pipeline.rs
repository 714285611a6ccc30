//! End-to-end tests of the mutation pipeline against an in-memory authority.

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidal_core::{
    BeforeDispatch, BeforePersist, Collection, CollectionConfig, Completion, CoreError,
    CoreResult, DispatchContext, DispatchDecision, DispatchOptions, DispatchOutcome,
    MiddlewareChain, MutationEvent, OpContext, Operation, OutboxConfig, Patch, PersistMode,
    TicketState, TxKey, WriteMode,
};
use tidal_protocol::{RemoteError, WriteIntent};
use tidal_testkit::prelude::*;

fn counter() -> (Arc<AtomicUsize>, impl Fn(&CoreError) + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move |_: &CoreError| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn same_tick_adds_are_confirmed_under_server_ids() {
    init_tracing();
    let authority = Arc::new(MemoryAuthority::with_server_ids());
    let todos = direct_collection("todos", authority.clone());

    let a = todos.add_one(json!({"title": "a"}));
    let b = todos.add_one(json!({"title": "b"}));
    let a = a.await.unwrap().into_entity().unwrap();
    let b = b.await.unwrap().into_entity().unwrap();

    assert_eq!(a.id(), Some("s1"));
    assert_eq!(b.id(), Some("s2"));
    let snapshot = todos.snapshot();
    assert_eq!(snapshot.ids().collect::<Vec<_>>(), vec!["s1", "s2"]);
    assert_eq!(snapshot.get("s1").unwrap().get("title"), Some(&json!("a")));
    assert_eq!(snapshot.get("s2").unwrap().get("title"), Some(&json!("b")));
    assert_eq!(snapshot.get("s1").unwrap().version(), Some(1));
    assert_eq!(authority.call_count(), 1, "both adds travel in one call");
}

#[tokio::test]
async fn optimistic_state_is_visible_before_confirmation() {
    let authority = Arc::new(MemoryAuthority::with_server_ids());
    authority.set_latency(Some(Duration::from_millis(50)));
    let todos = direct_collection("todos", authority.clone());
    let mut watch = todos.watch();

    let pending = todos.add_one(todo("write docs"));
    watch.changed().await.unwrap();
    let optimistic = watch.borrow_and_update().clone();
    assert_eq!(optimistic.len(), 1);
    let temp = optimistic.ids().next().unwrap().to_string();
    assert!(temp.starts_with(tidal_core::TEMP_ID_PREFIX));
    assert_eq!(authority.len("todos"), 0);

    pending.await.unwrap();
    let confirmed = todos.snapshot();
    assert_eq!(confirmed.len(), 1);
    assert!(!confirmed.contains(&temp));
    assert!(confirmed.contains("s1"));
}

#[tokio::test]
async fn missing_base_version_fails_before_any_network_call() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = direct_collection("todos", authority.clone());
    seed(&todos, vec![json!({"id": "a", "title": "no version"})]).await;
    let before = todos.snapshot();

    let err = todos
        .update_one("a", json!({"title": "changed"}))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("[requires baseVersion]"), "{err}");
    assert_eq!(authority.call_count(), 0);
    assert_eq!(todos.snapshot(), before);
}

#[tokio::test]
async fn update_encodes_cached_version() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "first"));
    let todos = direct_collection("todos", authority.clone());
    todos.fetch(None).await.unwrap();

    let updated = todos
        .update_one("a", json!({"title": "second"}))
        .await
        .unwrap()
        .into_entity()
        .unwrap();
    assert_eq!(updated.version(), Some(2));
    assert_eq!(updated.get("title"), Some(&json!("second")));
    assert_eq!(authority.version("todos", "a"), Some(2));
}

#[tokio::test]
async fn consecutive_updates_of_one_entity_chain_versions() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "v1"));
    let todos = direct_collection("todos", authority.clone());
    todos.fetch(None).await.unwrap();

    let first = todos.update_one("a", json!({"title": "v2"}));
    let second = todos.update_one("a", json!({"title": "v3"}));
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(authority.version("todos", "a"), Some(3));
    assert_eq!(todos.get("a").unwrap().get("title"), Some(&json!("v3")));
}

#[tokio::test]
async fn outbox_evicts_oldest_beyond_max_size() {
    let authority = Arc::new(MemoryAuthority::new());
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&dropped);
    let config = OutboxConfig::new()
        .with_max_size(2)
        .on_queue_full(move |entry| sink.lock().push(entry.seq));
    let (todos, _storage) = outbox_collection("todos", authority.clone(), config);

    let first = todos.add_one(json!({"id": "t1", "title": "1"}));
    let first_ticket = first.ticket().clone();
    first.await.unwrap();
    todos.add_one(json!({"id": "t2", "title": "2"})).await.unwrap();
    todos.add_one(json!({"id": "t3", "title": "3"})).await.unwrap();

    let outbox = todos.outbox().unwrap();
    let queued: Vec<_> = outbox
        .entries()
        .iter()
        .map(|e| e.intent.entity_id().unwrap().to_string())
        .collect();
    assert_eq!(queued, vec!["t2", "t3"]);
    assert_eq!(*dropped.lock(), vec![0]);
    assert!(matches!(first_ticket.state(), TicketState::Failed(CoreError::Evicted { seq: 0 })));
    assert_eq!(authority.call_count(), 0, "enqueueing never touches the network");
    assert_eq!(todos.snapshot().len(), 3, "optimistic state keeps every add");
}

#[tokio::test]
async fn local_first_outbox_writes_locally_before_queueing() {
    let remote = Arc::new(MemoryAuthority::new());
    let local = Arc::new(MemoryAuthority::new());
    let todos = Collection::builder("todos")
        .remote(remote.clone())
        .local_authority(local.clone())
        .outbox(
            Arc::new(tidal_core::MemoryStorage::new()),
            OutboxConfig::new().with_write_mode(WriteMode::LocalFirst),
        )
        .build()
        .unwrap();

    todos.add_one(json!({"id": "t1", "title": "here"})).await.unwrap();

    assert_eq!(local.entity("todos", "t1").unwrap()["title"], "here");
    assert_eq!(remote.call_count(), 0);
    assert_eq!(todos.outbox().unwrap().len(), 1);
}

#[tokio::test]
async fn local_first_versions_stay_out_of_the_cache() {
    let remote = Arc::new(MemoryAuthority::new());
    let local = Arc::new(MemoryAuthority::new());
    remote.server_write("todos", stored_todo("t1", 1, "a"));
    local.server_write("todos", stored_todo("t1", 1, "a"));
    let todos = Collection::builder("todos")
        .remote(remote.clone())
        .local_authority(local.clone())
        .outbox(
            Arc::new(tidal_core::MemoryStorage::new()),
            OutboxConfig::new().with_write_mode(WriteMode::LocalFirst),
        )
        .build()
        .unwrap();
    seed(&todos, vec![stored_todo("t1", 1, "a")]).await;

    todos.update_one("t1", json!({"title": "b"})).await.unwrap();

    assert_eq!(local.version("todos", "t1"), Some(2));
    let t1 = todos.get("t1").unwrap();
    assert_eq!(t1.get("title"), Some(&json!("b")));
    assert_eq!(t1.version(), Some(1));
    let queued = todos.outbox().unwrap().entries();
    assert_eq!(queued[0].intent.item.base_version, Some(1));
}

#[test]
fn local_first_outbox_needs_a_local_authority() {
    let err = Collection::builder("todos")
        .outbox(
            Arc::new(tidal_core::MemoryStorage::new()),
            OutboxConfig::new().with_write_mode(WriteMode::LocalFirst),
        )
        .build()
        .unwrap_err();
    assert!(matches!(err, CoreError::Config { .. }), "{err}");
}

#[tokio::test]
async fn server_assigned_create_is_refused_by_the_outbox() {
    let authority = Arc::new(MemoryAuthority::new());
    let (todos, _storage) = outbox_collection("todos", authority, OutboxConfig::new());

    let err = todos.create_one(todo("server id")).await.unwrap_err();
    assert!(err.is_validation(), "{err}");
    assert!(todos.outbox().unwrap().is_empty());
    assert!(todos.snapshot().is_empty());
}

#[tokio::test]
async fn outbox_persist_without_outbox_fails_fast() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = direct_collection("todos", authority.clone());
    let err = todos
        .dispatch(
            Operation::Add(tidal_core::Entity::from_value(todo("x")).unwrap()),
            DispatchOptions::new().with_persist(PersistMode::Outbox),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::OutboxNotConfigured { .. }));
    assert!(todos.snapshot().is_empty());
    assert_eq!(authority.call_count(), 0);
}

#[tokio::test]
async fn failed_persist_rolls_back_and_fails_every_operation_once() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "a"));
    authority.server_write("todos", stored_todo("b", 1, "b"));
    let todos = direct_collection("todos", authority.clone());
    todos.fetch(None).await.unwrap();
    let before = todos.snapshot();
    let events = todos.events().subscribe();

    authority.fail_next(1, false);
    let (update_fails, on_update_fail) = counter();
    let (remove_fails, on_remove_fail) = counter();
    let update = todos.dispatch(
        Operation::Update {
            id: "a".into(),
            changes: json!({"title": "changed"}).as_object().unwrap().clone(),
        },
        DispatchOptions::new().on_fail(on_update_fail),
    );
    let remove = todos.dispatch(
        Operation::ForceRemove { id: "b".into() },
        DispatchOptions::new().on_fail(on_remove_fail),
    );
    let update_ticket = update.ticket().clone();

    assert!(matches!(update.await, Err(CoreError::Transport(_))));
    assert!(matches!(remove.await, Err(CoreError::Transport(_))));
    assert_eq!(update_fails.load(Ordering::SeqCst), 1);
    assert_eq!(remove_fails.load(Ordering::SeqCst), 1);
    assert!(matches!(update_ticket.state(), TicketState::Failed(_)));
    assert_eq!(todos.snapshot(), before);

    let kinds: Vec<&'static str> = events
        .try_iter()
        .map(|event| match event {
            MutationEvent::Planned { .. } => "planned",
            MutationEvent::Committed { .. } => "committed",
            MutationEvent::RolledBack { .. } => "rolled_back",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["planned", "rolled_back"]);
}

#[tokio::test]
async fn planned_listeners_run_before_the_optimistic_apply() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "before"));
    let todos = direct_collection("todos", authority);
    seed(&todos, vec![stored_todo("a", 1, "before")]).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let reader = todos.clone();
    todos.events().listen(move |event| {
        if let MutationEvent::Planned { changed_ids, .. } = event {
            let title = reader.get("a").and_then(|e| e.get("title").cloned());
            sink.lock().push((changed_ids.clone(), title));
        }
    });

    todos.update_one("a", json!({"title": "after"})).await.unwrap();

    assert_eq!(*seen.lock(), vec![(vec!["a".to_string()], Some(json!("before")))]);
    assert_eq!(todos.get("a").unwrap().get("title"), Some(&json!("after")));
}

#[tokio::test]
async fn remote_conflict_rolls_back_with_current_copy() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "mine"));
    let todos = direct_collection("todos", authority.clone());
    todos.fetch(None).await.unwrap();
    authority.server_write("todos", stored_todo("a", 1, "theirs"));

    let err = todos.update_one("a", json!({"title": "edit"})).await.unwrap_err();
    assert!(err.is_conflict());
    match err {
        CoreError::Persistence { current, .. } => {
            assert_eq!(current.unwrap().version, Some(2));
        }
        other => panic!("unexpected {other}"),
    }
    assert_eq!(todos.get("a").unwrap().get("title"), Some(&json!("mine")));
}

#[tokio::test]
async fn missing_target_fails_only_its_operation() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "a"));
    let todos = direct_collection("todos", authority.clone());
    todos.fetch(None).await.unwrap();

    let missing = todos.update_one("ghost", json!({"title": "x"}));
    let present = todos.remove_one("a");
    assert!(matches!(missing.await, Err(CoreError::EntityNotFound { .. })));
    let removed = present.await.unwrap().into_entity().unwrap();
    assert!(removed.is_deleted());
    assert_eq!(authority.entity("todos", "a").unwrap()["deleted"], json!(true));
}

#[tokio::test]
async fn operations_apply_in_dispatch_order_across_segments() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "start"));
    let todos = direct_collection("todos", authority.clone());
    todos.fetch(None).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pending = Vec::new();
    for (i, scope) in ["x", "y", "x", "z"].into_iter().enumerate() {
        let log = Arc::clone(&seen);
        pending.push(todos.dispatch(
            Operation::Update {
                id: "a".into(),
                changes: json!({"title": format!("step {i}")}).as_object().unwrap().clone(),
            },
            DispatchOptions::new()
                .with_tx(TxKey::default().with_scope(scope))
                .on_success(move |entity| {
                    let title = entity.and_then(|e| e.get("title").cloned());
                    log.lock().push(title);
                }),
        ));
    }
    // await out of order; application order is dispatch order
    for dispatched in pending.into_iter().rev() {
        dispatched.await.unwrap();
    }

    let titles: Vec<_> = seen.lock().iter().map(|t| t.clone().unwrap()).collect();
    assert_eq!(titles, vec![json!("step 0"), json!("step 1"), json!("step 2"), json!("step 3")]);
    assert_eq!(authority.version("todos", "a"), Some(5));
}

#[tokio::test]
async fn strict_completion_times_out_and_settles_later() {
    let authority = Arc::new(MemoryAuthority::new());
    let (todos, _storage) = outbox_collection("todos", authority, OutboxConfig::new());

    let dispatched = todos.dispatch(
        Operation::Add(tidal_core::Entity::from_value(json!({"id": "t1"})).unwrap()),
        DispatchOptions::new().with_completion(Completion::Strict {
            timeout: Duration::from_millis(30),
        }),
    );
    let ticket = dispatched.ticket().clone();
    let err = dispatched.await.unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(ticket.state(), TicketState::Enqueued));
    assert!(todos.snapshot().contains("t1"), "a timeout does not roll back");

    assert!(todos.tickets().confirm(ticket.idempotency_key()));
    ticket.wait_confirmed(Some(Duration::from_millis(30))).await.unwrap();
    assert!(!todos.tickets().confirm(ticket.idempotency_key()));
}

#[tokio::test]
async fn direct_writes_confirm_tickets_immediately() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = Collection::builder("todos")
        .config(CollectionConfig::new("todos").with_completion(Completion::Strict {
            timeout: Duration::from_millis(200),
        }))
        .remote(authority)
        .build()
        .unwrap();
    let dispatched = todos.add_one(json!({"id": "t1"}));
    let ticket = dispatched.ticket().clone();
    dispatched.await.unwrap();
    assert!(matches!(ticket.state(), TicketState::Confirmed));
}

struct ReadOnly;

impl BeforeDispatch for ReadOnly {
    fn before_dispatch(&self, ctx: &mut DispatchContext<'_>) -> DispatchDecision {
        if ctx.operation.kind().is_hydrate() {
            DispatchDecision::Allow
        } else {
            DispatchDecision::Reject(format!("{} is read-only", ctx.collection))
        }
    }
}

#[tokio::test]
async fn panicking_reject_callback_still_settles_the_dispatch() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = Collection::builder("todos")
        .remote(authority)
        .middleware(MiddlewareChain::new().with_before_dispatch(Arc::new(ReadOnly)))
        .build()
        .unwrap();

    let rejected = todos.dispatch(
        Operation::Add(tidal_core::Entity::from_value(todo("x")).unwrap()),
        DispatchOptions::new().on_fail(|_| panic!("callback bug")),
    );
    assert!(matches!(rejected.ticket().state(), TicketState::Failed(_)));
    assert!(matches!(rejected.await, Err(CoreError::Rejected { .. })));
}

struct Stamp;

impl BeforePersist for Stamp {
    fn before_persist(
        &self,
        _collection: &str,
        _mode: PersistMode,
        intents: &mut Vec<WriteIntent>,
    ) -> CoreResult<()> {
        for intent in intents.iter_mut() {
            if let Some(serde_json::Value::Object(fields)) = intent.item.value.as_mut() {
                fields.insert("stamped".into(), json!(true));
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn middleware_rejects_without_queueing() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = Collection::builder("todos")
        .remote(authority.clone())
        .middleware(MiddlewareChain::new().with_before_dispatch(Arc::new(ReadOnly)))
        .build()
        .unwrap();

    let (fails, on_fail) = counter();
    let rejected = todos.dispatch(
        Operation::Add(tidal_core::Entity::from_value(todo("x")).unwrap()),
        DispatchOptions::new().on_fail(on_fail),
    );
    assert!(rejected.ticket().is_settled());
    assert!(matches!(rejected.await, Err(CoreError::Rejected { .. })));
    assert_eq!(fails.load(Ordering::SeqCst), 1);
    assert!(todos.snapshot().is_empty());

    seed(&todos, vec![json!({"id": "a"})]).await;
    assert!(todos.snapshot().contains("a"));
    assert_eq!(authority.call_count(), 0);
}

#[tokio::test]
async fn before_persist_rewrites_intents() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = Collection::builder("todos")
        .remote(authority.clone())
        .middleware(MiddlewareChain::new().with_before_persist(Arc::new(Stamp)))
        .build()
        .unwrap();
    let added = todos
        .add_one(json!({"id": "a", "title": "x"}))
        .await
        .unwrap()
        .into_entity()
        .unwrap();
    assert_eq!(authority.entity("todos", "a").unwrap()["stamped"], json!(true));
    assert_eq!(added.get("stamped"), Some(&json!(true)), "writeback carries the canonical value");
}

#[tokio::test]
async fn op_context_reports_patches_instead_of_callbacks() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "before"));
    let todos = direct_collection("todos", authority.clone());
    todos.fetch(None).await.unwrap();

    let successes = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&successes);
    let outcome = todos
        .dispatch(
            Operation::Update {
                id: "a".into(),
                changes: json!({"title": "after"}).as_object().unwrap().clone(),
            },
            DispatchOptions::new()
                .with_op_context(OpContext::new("rename"))
                .on_success(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await
        .unwrap();
    let DispatchOutcome::Patches { patches, inverse, changed_ids } = outcome else {
        panic!("expected patches");
    };
    assert_eq!(changed_ids, vec!["a".to_string()]);
    assert!(!patches.is_empty());
    assert!(!inverse.is_empty());
    assert_eq!(successes.load(Ordering::SeqCst), 0);

    // replaying the inverse is an undo
    todos
        .apply_patches(inverse, patches, OpContext::new("undo"))
        .await
        .unwrap();
    assert_eq!(todos.get("a").unwrap().get("title"), Some(&json!("before")));
    assert_eq!(authority.entity("todos", "a").unwrap()["title"], json!("before"));
}

#[tokio::test]
async fn patches_cannot_share_a_segment_with_other_kinds() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = direct_collection("todos", authority.clone());
    seed(&todos, vec![stored_todo("a", 1, "a")]).await;

    let patch = todos.apply_patches(
        vec![Patch::remove(vec!["a".into(), "title".into()])],
        vec![Patch::add(vec!["a".into(), "title".into()], json!("a"))],
        OpContext::new("edit"),
    );
    let add = todos.add_one(json!({"id": "b"}));
    assert!(matches!(patch.await, Err(CoreError::BatchingConflict { .. })));
    assert!(matches!(add.await, Err(CoreError::BatchingConflict { .. })));
    assert_eq!(authority.call_count(), 0);
}

#[tokio::test]
async fn fetch_hydrates_without_overwriting_cache() {
    let authority = Arc::new(MemoryAuthority::new());
    authority.server_write("todos", stored_todo("a", 1, "server"));
    authority.server_write("todos", stored_todo("b", 1, "server"));
    let todos = direct_collection("todos", authority.clone());
    seed(&todos, vec![stored_todo("a", 1, "local")]).await;

    let fetched = todos.fetch(None).await.unwrap();
    assert_eq!(fetched.len(), 2);
    assert_eq!(todos.get("a").unwrap().get("title"), Some(&json!("local")));
    assert_eq!(todos.get("b").unwrap().get("title"), Some(&json!("server")));
}

#[tokio::test]
async fn panicking_listener_does_not_break_the_pipeline() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = direct_collection("todos", authority);
    todos.events().listen(|_| panic!("listener bug"));
    let added = todos.add_one(json!({"id": "a"})).await.unwrap();
    assert!(added.entity().is_some());
}

#[tokio::test]
async fn outbox_survives_restart() {
    let authority = Arc::new(MemoryAuthority::new());
    let storage = TempStorage::new();
    {
        let todos = outbox_collection_with("todos", authority.clone(), storage.shared(), OutboxConfig::new());
        todos.add_one(json!({"id": "a", "title": "offline"})).await.unwrap();
        assert_eq!(todos.outbox().unwrap().len(), 1);
    }
    let restarted = outbox_collection_with("todos", authority, storage.reopen(), OutboxConfig::new());
    let entries = restarted.outbox().unwrap().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].intent.entity_id(), Some("a"));
}

#[tokio::test]
async fn remote_reject_event_is_reported() {
    let authority = Arc::new(MemoryAuthority::new());
    let todos = direct_collection("todos", authority);
    let events = todos.events().subscribe();
    let intent = WriteIntent::new(
        "todos",
        tidal_protocol::WriteAction::Update,
        Default::default(),
        tidal_protocol::WriteItem {
            entity_id: Some("a".into()),
            base_version: Some(1),
            value: None,
            meta: tidal_protocol::WriteMeta::new("k", 0),
        },
    );
    todos.report_remote_reject(
        &intent,
        &tidal_protocol::WriteReject {
            error: RemoteError::new("FORBIDDEN", "no"),
            current: None,
        },
    );
    assert!(matches!(
        events.try_recv(),
        Ok(MutationEvent::RemoteReject { entity_id: Some(id), .. }) if id == "a"
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn failed_segments_restore_the_snapshot(
        seeded in entity_map_strategy(),
        batch in mixed_batch_strategy(6),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let authority = Arc::new(MemoryAuthority::new());
            authority.set_offline(true);
            let todos = direct_collection("todos", authority);
            seed(&todos, values(&seeded)).await;
            let before = todos.snapshot();

            let mut counters = Vec::new();
            let mut pending = Vec::new();
            for operation in batch {
                let (fails, on_fail) = counter();
                counters.push(fails);
                pending.push(todos.dispatch(operation, DispatchOptions::new().on_fail(on_fail)));
            }
            for dispatched in pending {
                let _ = dispatched.await;
            }

            prop_assert_eq!(todos.snapshot(), before);
            for fails in counters {
                prop_assert_eq!(fails.load(Ordering::SeqCst), 1);
            }
            Ok(())
        })?;
    }
}
