use criterion::{criterion_group, criterion_main, Criterion};
use roompad_sync::{
    ClientFrame, FeedEvent, MemberId, MemoryBackend, Request, RoomBackend, RoomCode, RoomFeed,
    RoomId, RoomStore, ServerFrame, StoreConfig,
};
use std::hint::black_box;
use std::sync::Arc;

fn bench_update_encode(c: &mut Criterion) {
    let frame = ClientFrame::Request {
        id: 1,
        request: Request::Update {
            room_id: RoomId::new(),
            content: "x".repeat(1024),
        },
    };

    c.bench_function("update_frame_encode_1KB", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

fn bench_feed_decode(c: &mut Criterion) {
    let frame = ServerFrame::Feed {
        room_id: RoomId::new(),
        event: FeedEvent::content("x".repeat(1024)),
    };
    let encoded = frame.encode().unwrap();

    c.bench_function("feed_frame_decode_1KB", |b| {
        b.iter(|| {
            black_box(ServerFrame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_presence_count(c: &mut Criterion) {
    let members: Vec<MemberId> = (0..100).map(|_| MemberId::new()).collect();
    let event = FeedEvent::presence(members);

    c.bench_function("presence_count_100_members", |b| {
        b.iter(|| {
            black_box(black_box(&event).member_count());
        })
    });
}

fn bench_feed_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("feed_publish_1000_events_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let feed = RoomFeed::new(2048);

                let mut streams = Vec::new();
                for _ in 0..100 {
                    streams.push(feed.stream().await);
                }

                for i in 0..1000u64 {
                    feed.publish(FeedEvent::content(i.to_string()));
                }
                black_box(feed.subscriber_count());
            });
        })
    });
}

fn bench_memory_update(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let room = rt
        .block_on(backend.create_room(&RoomCode::parse("BENCH1").unwrap()))
        .unwrap();
    let content = "lorem ipsum ".repeat(100);

    c.bench_function("memory_update_room_content", |b| {
        b.iter(|| {
            rt.block_on(backend.update_room_content(room.id, black_box(&content)))
                .unwrap();
        })
    });
}

fn bench_store_save_room(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let mut room = roompad_sync::Room::new(RoomCode::parse("BENCH2").unwrap());
    room.content = Some("lorem ipsum ".repeat(1000));

    c.bench_function("store_save_room_12KB", |b| {
        b.iter(|| {
            store.save_room(black_box(&room)).unwrap();
        })
    });
}

fn bench_store_load_room(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let mut room = roompad_sync::Room::new(RoomCode::parse("BENCH3").unwrap());
    room.content = Some("lorem ipsum ".repeat(1000));
    store.save_room(&room).unwrap();

    c.bench_function("store_load_room_12KB", |b| {
        b.iter(|| {
            black_box(store.load_room(black_box(room.id)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_feed_decode,
    bench_presence_count,
    bench_feed_fanout,
    bench_memory_update,
    bench_store_save_room,
    bench_store_load_room,
);
criterion_main!(benches);
