// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::{build_item, init_logging, test_config, RecordingTransport};
use corecache::core::cache::CacheEngine;
use corecache::core::item::{ItemBuilder, ItemKind, ItemSource};
use corecache::core::query::ItemQuery;
use corecache::core::subscription::{SubscriptionRequest, SUBSCRIPTION_STATE_TYPE};
use corecache::core::util::{Clock, ManualClock};
use corecache::query_api::expression::Expression;

struct Fixture {
    clock: Arc<ManualClock>,
    transport: Arc<RecordingTransport>,
    engine: Arc<CacheEngine>,
}

fn fixture() -> Fixture {
    init_logging();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let transport = RecordingTransport::new();
    let engine = CacheEngine::new(
        test_config(),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&transport) as _,
        None,
    );
    Fixture {
        clock,
        transport,
        engine,
    }
}

#[test]
fn test_type_filtered_subscription_sees_matching_items_only() {
    let f = fixture();
    let now = f.clock.now();
    let request = SubscriptionRequest {
        data_type_name: Some("Foo".to_string()),
        ..SubscriptionRequest::matching_all(now)
    };
    let subscription_id = f.engine.create_subscription(Uuid::new_v4(), request);

    for index in 0..3 {
        f.engine.process_new_item(
            build_item(&format!("foo-{index}"), "S", "Foo", b"x", now),
            ItemSource::Client,
        );
    }
    f.engine.process_new_item(
        build_item("bar-0", "S", "Bar", b"x", now),
        ItemSource::Client,
    );

    let delivered = f.transport.delivered_item_ids(subscription_id);
    assert_eq!(delivered.len(), 3, "exactly the three Foo items");
}

#[test]
fn test_replay_then_live_delivers_each_item_exactly_once() {
    let f = fixture();
    let now = f.clock.now();

    let mut existing_ids = Vec::new();
    for index in 0..3 {
        let item = build_item(&format!("existing-{index}"), "S", "Foo", b"x", now);
        existing_ids.push(item.id);
        f.engine.process_new_item(item, ItemSource::Client);
    }

    let request = SubscriptionRequest {
        data_type_name: Some("Foo".to_string()),
        ..SubscriptionRequest::matching_all(now)
    };
    let subscription_id = f.engine.create_subscription(Uuid::new_v4(), request);

    let live = build_item("live-0", "S", "Foo", b"x", now);
    let live_id = live.id;
    f.engine.process_new_item(live, ItemSource::Client);

    let delivered = f.transport.delivered_item_ids(subscription_id);
    assert_eq!(delivered.len(), 4, "three replayed plus one live");
    for id in existing_ids.iter().chain([&live_id]) {
        assert_eq!(
            delivered.iter().filter(|d| *d == id).count(),
            1,
            "every item exactly once"
        );
    }
}

#[test]
fn test_exclude_existing_skips_replay() {
    let f = fixture();
    let now = f.clock.now();
    f.engine.process_new_item(
        build_item("existing", "S", "Foo", b"x", now),
        ItemSource::Client,
    );

    let request = SubscriptionRequest {
        data_type_name: Some("Foo".to_string()),
        exclude_existing: true,
        ..SubscriptionRequest::matching_all(now)
    };
    let subscription_id = f.engine.create_subscription(Uuid::new_v4(), request);
    assert!(f.transport.delivered_item_ids(subscription_id).is_empty());

    let live = build_item("live", "S", "Foo", b"x", now);
    let live_id = live.id;
    f.engine.process_new_item(live, ItemSource::Client);
    assert_eq!(f.transport.delivered_item_ids(subscription_id), vec![live_id]);
}

#[test]
fn test_expression_failure_cancels_only_that_subscription() {
    let f = fixture();
    let now = f.clock.now();

    // comparing a string property against a number fails at evaluation
    // time, which must be fatal for this subscription alone
    let brittle = SubscriptionRequest {
        expression: Expression::is_gtr("Currency", 5i64),
        ..SubscriptionRequest::matching_all(now)
    };
    let brittle_id = f.engine.create_subscription(Uuid::new_v4(), brittle);

    let healthy = SubscriptionRequest {
        data_type_name: Some("Trade".to_string()),
        ..SubscriptionRequest::matching_all(now)
    };
    let healthy_id = f.engine.create_subscription(Uuid::new_v4(), healthy);

    let subscriptions_before = f.engine.subscription_count();
    assert_eq!(subscriptions_before, 2);

    f.clock.advance(Duration::seconds(1));
    let item = ItemBuilder::new(ItemKind::Object, "Trade.1")
        .app_scope("S")
        .data_type("Trade")
        .prop("Currency", "USD")
        .seal(f.clock.now());
    let item_id = item.id;
    f.engine.process_new_item(item, ItemSource::Client);

    assert_eq!(f.engine.subscription_count(), 1, "brittle one cancelled");
    assert!(f
        .transport
        .delivered_item_ids(healthy_id)
        .contains(&item_id));
    assert!(!f
        .transport
        .delivered_item_ids(brittle_id)
        .contains(&item_id));
}

#[test]
fn test_recovery_record_is_an_ordinary_cached_item() {
    let f = fixture();
    let now = f.clock.now();
    let request = SubscriptionRequest {
        data_type_name: Some("Foo".to_string()),
        ..SubscriptionRequest::matching_all(now)
    };
    let subscription_id = f.engine.create_subscription(Uuid::new_v4(), request);

    let query = ItemQuery::new(f.clock.now())
        .with_kind(ItemKind::Local)
        .with_data_type(SUBSCRIPTION_STATE_TYPE);
    let records = f.engine.get_cache_items(&query);
    assert_eq!(records.len(), 1);
    assert!(records[0]
        .name
        .contains(&subscription_id.to_string()));

    // cancelling writes an expired replacement through the same pipeline
    f.clock.advance(Duration::seconds(1));
    f.engine.cancel_subscription(&subscription_id);
    assert_eq!(f.engine.subscription_count(), 0);
    let records = f.engine.get_cache_items(&ItemQuery::new(f.clock.now())
        .with_kind(ItemKind::Local)
        .with_data_type(SUBSCRIPTION_STATE_TYPE));
    assert!(records.is_empty(), "record no longer current");
}

#[test]
fn test_restore_from_recovery_record() {
    let f = fixture();
    let now = f.clock.now();
    let request = SubscriptionRequest {
        data_type_name: Some("Foo".to_string()),
        ..SubscriptionRequest::matching_all(now)
    };
    let subscription_id = f.engine.create_subscription(Uuid::new_v4(), request);

    // read the persisted record back and restore it into a fresh engine
    let record = f
        .engine
        .get_cache_items(
            &ItemQuery::new(now)
                .with_kind(ItemKind::Local)
                .with_data_type(SUBSCRIPTION_STATE_TYPE),
        )
        .pop()
        .expect("recovery record");
    let state: corecache::core::subscription::SubscriptionState =
        serde_json::from_slice(record.payload_bytes().unwrap()).unwrap();

    let other = fixture();
    let restored_id = other.engine.restore_subscription(&state).unwrap();
    assert_eq!(restored_id, subscription_id);
    assert_eq!(other.engine.subscription_count(), 1);

    // restored subscriptions resume live delivery
    let item = build_item("foo", "S", "Foo", b"x", other.clock.now());
    let item_id = item.id;
    other.engine.process_new_item(item, ItemSource::Client);
    assert_eq!(
        other.transport.delivered_item_ids(subscription_id),
        vec![item_id]
    );
}

#[test]
fn test_exclude_data_body_strips_payload_from_notifications() {
    let f = fixture();
    let now = f.clock.now();
    let request = SubscriptionRequest {
        data_type_name: Some("Foo".to_string()),
        exclude_data_body: true,
        ..SubscriptionRequest::matching_all(now)
    };
    let subscription_id = f.engine.create_subscription(Uuid::new_v4(), request);

    f.engine.process_new_item(
        build_item("foo", "S", "Foo", b"payload-bytes", now),
        ItemSource::Client,
    );
    let pages = f.transport.pages();
    let page = pages
        .iter()
        .find(|page| page.subscription_id == Some(subscription_id) && !page.items.is_empty())
        .expect("notification page");
    assert!(page.items[0].payload_bytes().is_none());
    // the cached copy keeps its payload
    let cached = f
        .engine
        .select_by_id(&page.items[0].id, 0, now, true)
        .unwrap();
    assert_eq!(cached.payload_bytes(), Some(&b"payload-bytes"[..]));
}

#[test]
fn test_extend_subscription_is_a_keepalive_noop() {
    let f = fixture();
    let request = SubscriptionRequest::matching_all(f.clock.now());
    let subscription_id = f.engine.create_subscription(Uuid::new_v4(), request);
    f.engine.extend_subscription(&subscription_id);
    assert_eq!(f.engine.subscription_count(), 1);
}
