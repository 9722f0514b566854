#![cfg(feature = "async")]

use quadlog::{
    submit, Action, Element, IndexManager, MemoryJournal, NexusDescriptor, NexusFactory, PoolConfig, Predicate,
    Rule, SlotPolicy, Step, Term,
};
use std::sync::Arc;
use tokio_stream::StreamExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_iterator_streams_asynchronously() {
    let journal = Arc::new(MemoryJournal::new(SlotPolicy::Worm, &PoolConfig::default()).unwrap());
    let rows: Vec<Element> = (0..100).map(|i| Element::from([i])).collect();
    journal.load("kb.a", &rows).unwrap();
    let im: Arc<dyn IndexManager> = journal.clone();
    let factory = NexusFactory::new(NexusDescriptor::new(Action::Query)).unwrap();

    let rule = Rule::builder("copy")
        .head(Predicate::new("kb.b", vec![Term::var("x")]).unwrap())
        .tail(Predicate::new("kb.a", vec![Term::var("x")]).unwrap())
        .build()
        .unwrap();
    let it = submit(&Step::from(rule), Action::Query, &factory, im)
        .unwrap()
        .into_query()
        .unwrap();

    let mut stream = it.into_stream();
    let mut seen = 0;
    while let Some(item) = stream.next().await {
        item.unwrap();
        seen += 1;
    }
    assert_eq!(seen, 100);
}
