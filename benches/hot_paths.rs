use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hazardwatch::classify::classify;
use hazardwatch::consumer::ingestion::build_deltas;
use hazardwatch::model::telemetry::decode_telemetry;
use hazardwatch::model::{DeviceAggregate, JerkSample, LocationAggregate, LocationStatus};
use hazardwatch::store::aggregate::merge_location;

fn samples(n: usize) -> Vec<JerkSample> {
    (0..n)
        .map(|i| JerkSample {
            vertical: (i as f64 * 0.7).sin() * 40.0,
            lateral: (i as f64 * 1.3).cos() * 35.0,
            forward: 1.0,
            timestamp: None,
        })
        .collect()
}

/// A telemetry batch of `items` readings spread over `locations` coordinates,
/// with every tenth item repeated.
fn telemetry_batch(items: usize, locations: usize) -> Vec<u8> {
    let mut entries = Vec::with_capacity(items);
    for i in 0..items {
        let n = if i % 10 == 9 { i - 1 } else { i };
        let loc = n % locations;
        entries.push(format!(
            r#"{{"deviceid":"dev-{}","latitude":{},"longitude":{},"carspeed":{},"jerks":[{{"verticaljerk":{},"lateraljerk":3,"forwardjerk":1}}]}}"#,
            n % 16,
            47.6 + loc as f64 * 1e-4,
            -122.3 - loc as f64 * 1e-4,
            10 + n % 30,
            n % 40,
        ));
    }
    format!("[{}]", entries.join(",")).into_bytes()
}

fn dataset(locations: usize) -> Vec<LocationAggregate> {
    (0..locations)
        .map(|i| LocationAggregate {
            latitude: 47.0 + i as f64 * 1e-3,
            longitude: -122.0 - i as f64 * 1e-3,
            altitude: None,
            status: LocationStatus::Caution,
            devices: vec![DeviceAggregate {
                device_id: format!("dev-{i}"),
                speed: 20.0,
                heading: 90.0,
                samples: samples(4),
            }],
        })
        .collect()
}

fn bench_classify(c: &mut Criterion) {
    let batch = samples(32);

    c.bench_function("classify/32_samples", |b| {
        b.iter(|| classify(black_box(30.0), black_box(&batch)))
    });
}

fn bench_build_deltas(c: &mut Criterion) {
    let body = telemetry_batch(256, 40);
    let items = decode_telemetry(&body).expect("decode telemetry batch");

    c.bench_function("build_deltas/256_items_40_locations", |b| {
        b.iter(|| {
            let deltas = build_deltas(black_box(items.clone()));
            black_box(deltas.len())
        })
    });
}

fn bench_merge(c: &mut Criterion) {
    let base = dataset(2_000);
    let delta = LocationAggregate {
        devices: vec![DeviceAggregate {
            device_id: "dev-new".to_string(),
            speed: 30.0,
            heading: 180.0,
            samples: samples(2),
        }],
        ..base[1_500].clone()
    };

    c.bench_function("merge_location/existing_of_2000", |b| {
        b.iter_batched(
            || base.clone(),
            |mut locations| {
                merge_location(&mut locations, black_box(delta.clone()));
                black_box(locations.len())
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_classify(c);
    bench_build_deltas(c);
    bench_merge(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
