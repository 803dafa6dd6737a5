//! Fan-out across all three phases, result-map contents and signal flow.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tephra_engine::{
    DbSignal, Deriver, Event, EventDb, EventDbOptions, EventDraft, Model, PhaseCtx, Preprocessor,
    Reducer, Reduction,
};

struct FanoutPre;

#[async_trait]
impl Preprocessor for FanoutPre {
    async fn preprocess(&self, ctx: &mut PhaseCtx<'_>) -> Result<Option<Event>, Value> {
        let kind = ctx.event().kind.clone();
        if kind == "hi" || kind == "pre" {
            ctx.dispatch(format!("pre-{kind}"), None);
        }
        Ok(None)
    }
}

struct FanoutRed;

#[async_trait]
impl Reducer for FanoutRed {
    async fn reduce(&self, ctx: &mut PhaseCtx<'_>) -> Result<Option<Reduction>, Value> {
        let kind = ctx.event().kind.clone();
        let mut reduction = Reduction::set_one(json!({ "id": kind }));
        if kind == "hi" || kind == "red" {
            ctx.dispatch(format!("red-{kind}"), None);
            reduction.events.push(EventDraft::new(format!("red-out-{kind}")));
        }
        Ok(Some(reduction))
    }
}

struct FanoutDer;

#[async_trait]
impl Deriver for FanoutDer {
    async fn derive(&self, ctx: &mut PhaseCtx<'_>) -> Result<(), Value> {
        let kind = ctx.event().kind.clone();
        if kind == "hi" || kind == "der" {
            ctx.dispatch(format!("der-{kind}"), None);
        }
        Ok(())
    }
}

async fn open_db(dir: &tempfile::TempDir) -> EventDb {
    let model = Model::new("foo")
        .with_preprocessor(Arc::new(FanoutPre))
        .with_reducer(Arc::new(FanoutRed))
        .with_deriver(Arc::new(FanoutDer));
    EventDb::open(
        EventDbOptions::new(dir.path().join("db.sqlite")),
        vec![model],
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn all_three_phases_fan_out() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let event = db.dispatch("hi", None, None).await.unwrap();
    let kinds: Vec<&str> = event.events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(event.events.len(), 4);
    assert_eq!(kinds, vec!["pre-hi", "red-hi", "red-out-hi", "der-hi"]);
    for id in ["pre-hi", "red-hi", "red-out-hi", "der-hi"] {
        let row = db.store().get("foo", id).await.unwrap();
        assert!(row.is_some(), "missing row {id}");
    }

    let event = db.dispatch("pre", None, None).await.unwrap();
    assert_eq!(event.events.len(), 1);
    assert!(db.store().get("foo", "pre-pre").await.unwrap().is_some());

    db.dispatch("red", None, None).await.unwrap();
    assert!(db.store().get("foo", "red-red").await.unwrap().is_some());
    assert!(db.store().get("foo", "red-out-red").await.unwrap().is_some());

    db.dispatch("der", None, None).await.unwrap();
    assert!(db.store().get("foo", "der-der").await.unwrap().is_some());
}

#[tokio::test]
async fn children_share_the_root_version() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let event = db.dispatch("hi", None, None).await.unwrap();
    assert_eq!(event.v, 1);
    for child in &event.events {
        assert_eq!(child.v, 1);
        assert!(child.is_handled());
    }
}

#[tokio::test]
async fn result_holds_exactly_the_reducing_models() {
    let dir = tempfile::tempdir().unwrap();
    let model = Model::new("foo").with_reducer(Arc::new(FanoutRed));
    let silent = Model::new("bystander");
    let db = EventDb::open(
        EventDbOptions::new(dir.path().join("db.sqlite")),
        vec![model, silent],
    )
    .await
    .unwrap();

    let event = db.dispatch("quiet-kind", None, None).await.unwrap();
    let result = event.result.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result["foo"], json!({"set": [{"id": "quiet-kind"}]}));
}

#[tokio::test]
async fn versions_stay_dense_across_dispatches() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    for _ in 0..5 {
        db.dispatch("der", None, None).await.unwrap();
    }

    let queue = db.queue();
    assert_eq!(queue.max_v().await.unwrap(), 5);
    for v in 1..=5 {
        let event = queue.get(v).await.unwrap().unwrap();
        assert_eq!(event.v, v);
        assert!(event.is_handled());
    }
    assert_eq!(db.version().await.unwrap(), 5);
}

#[tokio::test]
async fn signals_flow_for_a_handled_event() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;
    let mut rx = db.subscribe();

    db.dispatch("der", None, None).await.unwrap();

    let mut begins = 0;
    let mut ends = 0;
    let mut finals = 0;
    let mut results = 0;
    while let Ok(signal) = rx.try_recv() {
        match signal {
            DbSignal::Begin => begins += 1,
            DbSignal::End => ends += 1,
            DbSignal::Finally => finals += 1,
            DbSignal::Result(event) => {
                results += 1;
                assert_eq!(event.kind, "der");
            }
            DbSignal::Rollback | DbSignal::Error(_) => panic!("unexpected failure signal"),
        }
    }
    // Enqueue and processing each run a transaction.
    assert!(begins >= 2);
    assert_eq!(begins, ends);
    assert_eq!(begins, finals);
    assert_eq!(results, 1);
}
