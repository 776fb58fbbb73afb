//! Mailbox and dispatch throughput
//!
//! - raw mailbox enqueue/dequeue per lane
//! - send-to-handled latency through the worker pool
//! - request/response round trips

use actor_core::mailbox::Mailbox;
use actor_core::{atoms, ActorId, ActorSystem, Behavior, Message, Reply};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_channel::bounded;
use std::time::Duration;

fn bench_mailbox_lanes(c: &mut Criterion) {
    let mut group = c.benchmark_group("mailbox");

    for batch in [1usize, 64, 1024] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_dequeue", batch), &batch, |b, &batch| {
            let mailbox = Mailbox::new(ActorId::from_raw(1));
            let message = Message::new((atoms::PUT, 42i64));
            b.iter(|| {
                for _ in 0..batch {
                    mailbox.enqueue(message.clone());
                }
                while let Some(message) = mailbox.try_dequeue() {
                    black_box(message);
                }
            });
        });
    }

    group.bench_function("mixed_priorities", |b| {
        let mailbox = Mailbox::new(ActorId::from_raw(2));
        let normal = Message::new((1i64,));
        let urgent = normal.with_priority(actor_core::Priority::High);
        b.iter(|| {
            for i in 0..64 {
                mailbox.enqueue(if i % 8 == 0 { urgent.clone() } else { normal.clone() });
            }
            while let Some(message) = mailbox.try_dequeue() {
                black_box(message);
            }
        });
    });

    group.finish();
}

fn bench_actor_dispatch(c: &mut Criterion) {
    let system = ActorSystem::with_defaults().expect("default configuration is valid");
    let mut group = c.benchmark_group("actor");

    let (done_tx, done_rx) = bounded(1);
    let batch = 1_000u64;
    let counter = system.spawn_with(0u64, move |_, _ctx| {
        Behavior::new().on(move |count: &mut u64, _, (_n,): (i64,)| {
            *count += 1;
            if *count % batch == 0 {
                let _ = done_tx.send(());
            }
            Reply::none()
        })
    });

    group.throughput(Throughput::Elements(batch));
    group.bench_function("send_batch", |b| {
        b.iter(|| {
            for n in 0..batch as i64 {
                counter.send((n,));
            }
            done_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("batch handled");
        });
    });

    let pong = system.spawn(|_ctx| {
        Behavior::new().on_atom(atoms::PING, |_, _, ()| Reply::value(atoms::PONG))
    });
    group.throughput(Throughput::Elements(1));
    group.bench_function("request_round_trip", |b| {
        b.iter(|| {
            let response = system
                .request(&pong, (atoms::PING,), Duration::from_secs(1))
                .wait()
                .expect("pong");
            black_box(response);
        });
    });

    group.finish();
    system.shutdown();
}

criterion_group!(benches, bench_mailbox_lanes, bench_actor_dispatch);
criterion_main!(benches);
