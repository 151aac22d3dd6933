use chrono::{FixedOffset, TimeZone, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use jobrelay_core::{JobId, JobRecord, Notification, fingerprint};

fn bench_fingerprint(c: &mut Criterion) {
    let at = Utc.timestamp_opt(1_700_000_000, 500).single().unwrap();
    let zone = FixedOffset::east_opt(13 * 3600).unwrap();
    let local = at.with_timezone(&zone);

    c.bench_function("fingerprint_utc", |b| {
        b.iter(|| fingerprint(black_box(JobId::new(42)), black_box(&at)))
    });

    c.bench_function("fingerprint_offset", |b| {
        b.iter(|| fingerprint(black_box(JobId::new(42)), black_box(&local)))
    });
}

fn bench_notification(c: &mut Criterion) {
    let mut job = JobRecord::new(vec![0u8; 256]);
    job.id = Some(JobId::new(42));

    c.bench_function("notification_encode_decode", |b| {
        b.iter(|| {
            let bytes = Notification::for_job(black_box(&job)).unwrap().to_bytes().unwrap();
            Notification::from_bytes(&bytes).unwrap()
        })
    });
}

criterion_group!(benches, bench_fingerprint, bench_notification);
criterion_main!(benches);
