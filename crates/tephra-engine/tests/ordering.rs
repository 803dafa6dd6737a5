//! Depth-first traversal order and deterministic sequencing of concurrent
//! dispatches.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use tephra_engine::{
    DbSignal, Deriver, EventDb, EventDbOptions, Model, PhaseCtx, Reducer, Reduction,
};

/// Reducer half of the ordering scenario: seeing `3` spawns `4`.
struct OrderRed;

#[async_trait]
impl Reducer for OrderRed {
    async fn reduce(&self, ctx: &mut PhaseCtx<'_>) -> Result<Option<Reduction>, Value> {
        if ctx.event().kind == "3" {
            ctx.dispatch("4", None);
        }
        Ok(None)
    }
}

/// Deriver half: `hi` spawns `1` and `3`, `1` spawns `2`, `3` spawns `5`,
/// and every visit appends the event type to the `all` field of row `hi`.
struct OrderDer;

#[async_trait]
impl Deriver for OrderDer {
    async fn derive(&self, ctx: &mut PhaseCtx<'_>) -> Result<(), Value> {
        let kind = ctx.event().kind.clone();
        match kind.as_str() {
            "hi" => {
                ctx.dispatch("1", None);
                ctx.dispatch("3", None);
            }
            "1" => ctx.dispatch("2", None),
            "3" => ctx.dispatch("5", None),
            _ => {}
        }

        let row = ctx
            .get("foo", "hi")
            .await?
            .unwrap_or_else(|| json!({ "id": "hi", "all": "" }));
        let all = format!("{}{kind}", row["all"].as_str().unwrap_or(""));
        ctx.put("foo", &json!({ "id": "hi", "all": all })).await?;
        Ok(())
    }
}

#[tokio::test]
async fn traversal_is_depth_first_pre_order() {
    let dir = tempfile::tempdir().unwrap();
    let model = Model::new("foo")
        .with_reducer(Arc::new(OrderRed))
        .with_deriver(Arc::new(OrderDer));
    let db = EventDb::open(
        EventDbOptions::new(dir.path().join("db.sqlite")),
        vec![model],
    )
    .await
    .unwrap();
    let mut rx = db.subscribe();

    let event = db.dispatch("hi", None, None).await.unwrap();

    // Two root-level children; the grandchildren live inside them.
    assert_eq!(event.events.len(), 2);
    assert_eq!(event.events[0].kind, "1");
    assert_eq!(event.events[0].events[0].kind, "2");
    assert_eq!(event.events[1].kind, "3");
    let under_three: Vec<&str> = event.events[1]
        .events
        .iter()
        .map(|e| e.kind.as_str())
        .collect();
    assert_eq!(under_three, vec!["4", "5"]);

    // The accumulator saw the pre-order visitation.
    let row = db.store().get("foo", "hi").await.unwrap().unwrap();
    assert_eq!(row["all"], "hi12345");

    // The result listener fires exactly once: children do not emit.
    let mut results = 0;
    while let Ok(signal) = rx.try_recv() {
        if matches!(signal, DbSignal::Result(_)) {
            results += 1;
        }
    }
    assert_eq!(results, 1);
}

/// Counter reducer that records the cumulative counts it observed, so the
/// test can assert what each event saw mid-pipeline.
struct CountingRed {
    seen: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Reducer for CountingRed {
    async fn reduce(&self, ctx: &mut PhaseCtx<'_>) -> Result<Option<Reduction>, Value> {
        let kind = ctx.event().kind.clone();
        let mut counts = ctx
            .get("counter", "counts")
            .await?
            .unwrap_or_else(|| json!({ "id": "counts" }));
        let next = counts[&kind].as_i64().unwrap_or(0) + 1;
        if let Some(object) = counts.as_object_mut() {
            object.insert(kind, json!(next));
        }
        self.seen.lock().unwrap().push(counts.clone());
        Ok(Some(Reduction::set_one(counts)))
    }
}

#[tokio::test]
async fn concurrent_dispatches_sequence_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let model = Model::new("counter").with_reducer(Arc::new(CountingRed { seen: seen.clone() }));
    let db = EventDb::open(
        EventDbOptions::new(dir.path().join("db.sqlite")),
        vec![model],
    )
    .await
    .unwrap();

    let first = db.dispatch("whattup", None, None);
    let second = db.dispatch("dude", None, None);
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().v, 1);
    assert_eq!(second.unwrap().v, 2);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], json!({ "id": "counts", "whattup": 1 }));
    assert_eq!(seen[1], json!({ "id": "counts", "whattup": 1, "dude": 1 }));

    let row = db.store().get("counter", "counts").await.unwrap().unwrap();
    assert_eq!(row, json!({ "id": "counts", "whattup": 1, "dude": 1 }));
}
