//! End-to-end scenarios against the public `Database`/`Collection` surface.
//!
//! Each test below exercises one full round trip through planning and
//! execution rather than a single component in isolation.

use docq::{Database, WriteOp};
use serde_json::json;

#[test]
fn s1_insert_and_find_by_id() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("people").unwrap();

    let inserted = col.insert_one(json!({"name": "Alice"})).unwrap();
    let id = inserted["_id"].clone();

    let found = col.find_one(json!({"_id": id.clone()})).unwrap().unwrap();
    assert_eq!(found["_id"], id);
    assert_eq!(found["name"], "Alice");
}

#[test]
fn s2_range_query_returns_exactly_the_inclusive_window_in_insertion_order() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("people").unwrap();
    for age in [20, 30, 40, 50, 60] {
        col.insert_one(json!({"age": age})).unwrap();
    }

    let matched = col
        .find(json!({"age": {"$gte": 30, "$lte": 50}}))
        .collect_all()
        .unwrap();

    let ages: Vec<i64> = matched.iter().map(|d| d["age"].as_i64().unwrap()).collect();
    assert_eq!(ages, vec![30, 40, 50]);
}

#[test]
fn s3_unwind_group_sort_limit_applies_limit_after_the_group() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("posts").unwrap();
    col.insert_one(json!({"tags": ["a", "b"]})).unwrap();
    col.insert_one(json!({"tags": ["b", "c"]})).unwrap();
    col.insert_one(json!({"tags": ["a", "c"]})).unwrap();

    let pipeline = vec![
        json!({"$unwind": "$tags"}),
        json!({"$group": {"_id": "$tags", "n": {"$sum": 1}}}),
        json!({"$sort": {"n": -1, "_id": 1}}),
        json!({"$limit": 2}),
    ];
    let result = col.aggregate(pipeline).unwrap();
    assert_eq!(result, vec![json!({"_id": "a", "n": 2}), json!({"_id": "b", "n": 2})]);
}

#[test]
fn s4_text_search_with_and_without_fts_agree() {
    let with_index = {
        let db = Database::open_in_memory().unwrap();
        let col = db.collection("articles").unwrap();
        col.create_index(docq::IndexDescriptor::fts("body_fts", vec!["body".to_string()], "simple"))
            .unwrap();
        col.insert_one(json!({"body": "the quick brown fox"})).unwrap();
        col.insert_one(json!({"body": "lazy dog"})).unwrap();

        col.aggregate(vec![
            json!({"$match": {"$text": {"$search": "fox"}}}),
            json!({"$project": {"_id": 0, "body": 1}}),
        ])
        .unwrap()
    };
    assert_eq!(with_index, vec![json!({"body": "the quick brown fox"})]);

    let without_index = {
        let db = Database::open_in_memory().unwrap();
        let col = db.collection("articles").unwrap();
        col.insert_one(json!({"body": "the quick brown fox"})).unwrap();
        col.insert_one(json!({"body": "lazy dog"})).unwrap();

        col.aggregate(vec![
            json!({"$match": {"$text": {"$search": "fox"}}}),
            json!({"$project": {"_id": 0, "body": 1}}),
        ])
        .unwrap()
    };
    assert_eq!(without_index, with_index);
}

#[test]
fn s5_lookup_matches_regardless_of_insertion_order() {
    let db = Database::open_in_memory().unwrap();
    let orders = db.collection("orders").unwrap();
    let customers = db.collection("customers").unwrap();

    orders.insert_one(json!({"oid": 1, "cid": 7})).unwrap();
    customers.insert_one(json!({"_id": 7, "name": "Bob"})).unwrap();

    let result = orders
        .aggregate(vec![
            json!({"$lookup": {"from": "customers", "localField": "cid", "foreignField": "_id", "as": "c"}}),
            json!({"$unwind": "$c"}),
            json!({"$project": {"_id": 0, "name": "$c.name"}}),
        ])
        .unwrap();
    assert_eq!(result, vec![json!({"name": "Bob"})]);
}

#[test]
fn s6_ordered_bulk_write_leaves_no_trace_of_either_insert_on_failure() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("widgets").unwrap();
    col.insert_one(json!({"_id": "dup", "marker": "pre-existing"})).unwrap();

    let ops = vec![
        WriteOp::InsertOne(json!({"_id": "a", "marker": "new"})),
        WriteOp::InsertOne(json!({"_id": "dup", "marker": "collides"})),
    ];
    let err = col.bulk_write(ops, true).unwrap_err();
    assert!(matches!(err, docq::DocqError::DuplicateKey { .. }));

    let all = col.find(json!({})).collect_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0]["marker"], "pre-existing");
}

#[test]
fn invariant_insert_many_count_matches_find_count() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("widgets").unwrap();
    let docs = vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})];
    let report = col.insert_many(docs.clone(), true).unwrap();
    assert_eq!(report.succeeded.len(), docs.len());
    assert_eq!(col.find(json!({})).collect_all().unwrap().len(), docs.len());
}

#[test]
fn invariant_every_found_document_has_a_unique_non_null_id() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("widgets").unwrap();
    for n in 0..5 {
        col.insert_one(json!({"n": n})).unwrap();
    }
    let all = col.find(json!({})).collect_all().unwrap();
    let mut ids: Vec<String> = all
        .iter()
        .map(|d| {
            assert!(!d["_id"].is_null());
            d["_id"].to_string()
        })
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), all.len());
}

#[test]
fn invariant_update_many_set_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("widgets").unwrap();
    col.insert_one(json!({"n": 1, "status": "new"})).unwrap();
    col.insert_one(json!({"n": 2, "status": "new"})).unwrap();

    col.update_many(json!({}), json!({"$set": {"status": "done"}}), false).unwrap();
    let after_first = col.find(json!({})).collect_all().unwrap();

    col.update_many(json!({}), json!({"$set": {"status": "done"}}), false).unwrap();
    let after_second = col.find(json!({})).collect_all().unwrap();

    assert_eq!(after_first, after_second);
}

#[test]
fn invariant_match_then_limit_commutes_with_client_side_take() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("widgets").unwrap();
    for n in 0..10 {
        col.insert_one(json!({"n": n, "even": n % 2 == 0})).unwrap();
    }

    let via_pipeline_limit = col
        .aggregate(vec![json!({"$match": {"even": true}}), json!({"$limit": 2})])
        .unwrap();

    let mut via_client_take = col.aggregate(vec![json!({"$match": {"even": true}})]).unwrap();
    via_client_take.truncate(2);

    let mut a: Vec<_> = via_pipeline_limit.into_iter().collect();
    let mut b: Vec<_> = via_client_take.into_iter().collect();
    a.sort_by_key(serde_json::Value::to_string);
    b.sort_by_key(serde_json::Value::to_string);
    assert_eq!(a, b);
}

#[test]
fn invariant_range_query_applies_both_bounds() {
    let db = Database::open_in_memory().unwrap();
    let col = db.collection("widgets").unwrap();
    for n in 0..20 {
        col.insert_one(json!({"n": n})).unwrap();
    }
    let matched = col.find(json!({"n": {"$gte": 8, "$lte": 12}})).collect_all().unwrap();
    let ns: Vec<i64> = matched.iter().map(|d| d["n"].as_i64().unwrap()).collect();
    assert_eq!(ns, vec![8, 9, 10, 11, 12]);
}

#[test]
fn forced_stream_fallback_agrees_with_the_fused_sql_plan() {
    let fused = {
        let db = Database::open_in_memory().unwrap();
        let col = db.collection("widgets").unwrap();
        for n in 0..6 {
            col.insert_one(json!({"n": n})).unwrap();
        }
        col.aggregate(vec![
            json!({"$match": {"n": {"$gte": 2}}}),
            json!({"$sort": {"n": 1}}),
            json!({"$limit": 3}),
        ])
        .unwrap()
    };

    let streamed = {
        let db = Database::open_with_config(docq::EngineConfig::in_memory().with_forced_fallback(true)).unwrap();
        let col = db.collection("widgets").unwrap();
        for n in 0..6 {
            col.insert_one(json!({"n": n})).unwrap();
        }
        col.aggregate(vec![
            json!({"$match": {"n": {"$gte": 2}}}),
            json!({"$sort": {"n": 1}}),
            json!({"$limit": 3}),
        ])
        .unwrap()
    };

    assert_eq!(fused, streamed);
}
