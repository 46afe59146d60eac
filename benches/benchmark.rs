use busrpc::{Params, Response, SubjectCodec};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn bench_subject_parse(c: &mut Criterion) {
    let codec = SubjectCodec::qualified("prod", "shop");
    c.bench_function("parse qualified subject", |b| {
        b.iter(|| codec.parse(black_box("prod.shop.user.profile.update")))
    });
    c.bench_function("format subscription subject", |b| {
        b.iter(|| codec.subscription_subject(black_box("user.profile")))
    });
}

fn bench_envelope(c: &mut Criterion) {
    let payload = br#"{"id":"42","name":"alice","HEADER":{"User-Agent":"bench"},"req_id":"r-1"}"#;
    c.bench_function("decode params", |b| {
        b.iter(|| Params::decode(black_box(payload)))
    });

    let response = Response::success(json!({"id": 42, "tags": ["a", "b", "c"]}));
    c.bench_function("encode success envelope", |b| {
        b.iter(|| serde_json::to_vec(black_box(&response)))
    });
}

criterion_group!(benches, bench_subject_parse, bench_envelope);
criterion_main!(benches);
