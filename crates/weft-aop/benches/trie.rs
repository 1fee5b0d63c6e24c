//! Signature trie lookup benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weft_aop::SignatureIndexer;

fn bench_trie(c: &mut Criterion) {
    let mut signatures: Vec<String> = (0..2000)
        .map(|i| format!("method{:04};java.lang.String;int;{}", i, i % 7))
        .collect();
    signatures.sort();
    let indexer = SignatureIndexer::build(&signatures);

    c.bench_function("trie_build_2k", |b| {
        b.iter(|| SignatureIndexer::build(black_box(&signatures)))
    });

    c.bench_function("trie_lookup", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 997) % signatures.len();
            black_box(indexer.apply(&signatures[i]))
        })
    });
}

criterion_group!(benches, bench_trie);
criterion_main!(benches);
