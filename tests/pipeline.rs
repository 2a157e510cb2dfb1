use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use pixytrack_rs::config::{Program, VisionConfig};
use pixytrack_rs::pipeline::{event_queue, VisionContext};
use pixytrack_rs::synth::{blob_frame, EdgeItem, EdgeScene, SceneRect};
use pixytrack_rs::tracking::TrackState;
use pixytrack_rs::FrameError;

fn context(program: Program) -> VisionContext {
    let mut config = VisionConfig::new(program);
    config.blobs.filtering = 1;
    let mut ctx = VisionContext::new(config);
    ctx.open();
    ctx
}

fn vertical_line() -> EdgeItem {
    EdgeItem::VerticalLine {
        pos: 306,
        width: 12,
        top: 8,
        bottom: 95,
    }
}

#[test]
fn test_blob_identity_follows_moving_object() {
    let mut ctx = context(Program::Blobs);
    let published = ctx.published();
    let (tx, rx) = event_queue(4096, 10);

    let base = SceneRect::new(1, 20, 40, 30, 50);
    for i in 0..10u64 {
        tx.push_frame(blob_frame(&[base.shifted(2 * i as i32, 0)]));
        ctx.process_frame_at(&rx, i * 20).unwrap();

        let detections = published.read().unwrap();
        assert_eq!(detections.frame, i + 1);
        if i == 0 {
            assert!(detections.blobs.is_empty());
            continue;
        }
        assert_eq!(detections.blobs.len(), 1, "帧 {}", i);
        assert_eq!(detections.blobs[0].index, 0);
        assert_eq!(detections.blobs[0].model, 1);
    }
}

#[test]
fn test_blob_lost_object_trails_then_new_identity() {
    let mut ctx = context(Program::Blobs);
    let (tx, rx) = event_queue(4096, 10);
    let rect = SceneRect::new(2, 50, 70, 10, 30);

    tx.push_frame(blob_frame(&[rect]));
    ctx.process_frame_at(&rx, 0).unwrap();
    tx.push_frame(blob_frame(&[rect]));
    ctx.process_frame_at(&rx, 20).unwrap();

    // 消失一帧: 进入尾随期, 仍然保留身份
    tx.push_frame(blob_frame(&[]));
    ctx.process_frame_at(&rx, 40).unwrap();
    let engine = ctx.blob_engine().unwrap();
    assert_eq!(engine.trackers().find(0).map(|t| t.state()), Some(TrackState::Trailing));

    tx.push_frame(blob_frame(&[rect]));
    ctx.process_frame_at(&rx, 45).unwrap();
    let blobs = ctx.blob_engine().unwrap().get_blobs(0xff, 10);
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].index, 0);

    // 长时间消失后重新出现的是新身份
    for t in [100, 200, 300, 400] {
        tx.push_frame(blob_frame(&[]));
        ctx.process_frame_at(&rx, t).unwrap();
    }
    assert!(ctx.blob_engine().unwrap().trackers().is_empty());
    tx.push_frame(blob_frame(&[rect]));
    ctx.process_frame_at(&rx, 420).unwrap();
    let ids: Vec<u16> = ctx
        .blob_engine()
        .unwrap()
        .trackers()
        .iter()
        .map(|t| t.id())
        .collect();
    assert_eq!(ids, vec![1]);
}

#[test]
fn test_threaded_blob_pipeline() {
    let mut ctx = context(Program::Blobs);
    let published = ctx.published();
    let (tx, rx) = event_queue(0x4000, 100);

    let producer = thread::spawn(move || {
        for _ in 0..6 {
            tx.push_frame(blob_frame(&[SceneRect::new(3, 100, 130, 40, 70)]));
            thread::sleep(Duration::from_millis(20));
        }
    });

    let stop = AtomicBool::new(false);
    let stats = ctx.run(&rx, &stop).unwrap();
    producer.join().unwrap();

    assert_eq!(stats.frames, 6);
    assert_eq!(stats.aborted, 0);
    let last = published.read().unwrap();
    assert_eq!(last.frame, 6);
    assert_eq!(last.blobs.len(), 1);
    assert_eq!(last.blobs[0].model, 3);
}

#[test]
fn test_line_primary_vector_published() {
    let mut ctx = context(Program::Lines);
    let published = ctx.published();
    let (tx, rx) = event_queue(0x4000, 10);
    let mut scene = EdgeScene::new(vec![vertical_line()]);

    tx.push_frame(scene.next_frame());
    assert_eq!(ctx.process_frame_at(&rx, 0), Ok(1));
    let first = published.read().unwrap();
    assert!(first.primary.unwrap().vector.is_none());
    assert_eq!(first.all.unwrap().lines[0].flags, TrackState::Leading.code());

    tx.push_frame(scene.next_frame());
    ctx.process_frame_at(&rx, 33).unwrap();
    let second = published.read().unwrap();
    let v = second.primary.unwrap().vector.unwrap();
    assert_eq!((v.x0, v.y0, v.x1, v.y1), (39, 47, 39, 4));
    assert_eq!(v.index, 0);
    let all = second.all.unwrap();
    assert_eq!(all.lines.len(), 1);
    assert_eq!(all.lines[0].flags, TrackState::Valid.code());
}

#[test]
fn test_line_identity_survives_jitter() {
    let mut ctx = context(Program::Lines);
    let published = ctx.published();
    let (tx, rx) = event_queue(0x4000, 10);
    let mut scene = EdgeScene::new(vec![vertical_line()]).with_jitter(8, 3);

    for i in 0..12u64 {
        tx.push_frame(scene.next_frame());
        ctx.process_frame_at(&rx, i * 33).unwrap();
        if i == 0 {
            continue;
        }
        let primary = published.read().unwrap().primary.unwrap();
        assert_eq!(primary.vector.map(|v| v.index), Some(0), "帧 {}", i);
    }
}

#[test]
fn test_barcode_reported_once() {
    let mut ctx = context(Program::Lines);
    let published = ctx.published();
    let (tx, rx) = event_queue(0x4000, 10);
    let mut scene = EdgeScene::new(vec![EdgeItem::Barcode {
        left: 100,
        unit: 4,
        value: 10,
        top: 10,
        bottom: 14,
    }]);

    let mut reported = Vec::new();
    for i in 0..4u64 {
        tx.push_frame(scene.next_frame());
        ctx.process_frame_at(&rx, i * 33).unwrap();
        if let Some(code) = published.read().unwrap().primary.unwrap().barcode {
            reported.push((i, code.code, code.index));
        }
    }
    assert_eq!(reported, vec![(1, 10, 0)]);
}

#[test]
fn test_line_overrun_keeps_primary() {
    let mut ctx = context(Program::Lines);
    let published = ctx.published();
    let (tx, rx) = event_queue(0x4000, 10);
    let mut scene = EdgeScene::new(vec![vertical_line()]);

    for t in [0, 33] {
        tx.push_frame(scene.next_frame());
        ctx.process_frame_at(&rx, t).unwrap();
    }

    // 源端错误字作为哨兵出现在帧中间
    let mut broken = scene.next_frame();
    broken.insert(100, pixytrack_rs::ScanEvent::from_edge_word(0xfffe));
    broken.truncate(101);
    tx.push_frame(broken);
    assert_eq!(ctx.process_frame_at(&rx, 66), Err(FrameError::Overrun));
    assert_eq!(published.seq(), 2);

    tx.push_frame(scene.next_frame());
    ctx.process_frame_at(&rx, 99).unwrap();
    let v = published.read().unwrap().primary.unwrap().vector.unwrap();
    assert_eq!(v.index, 0);
    assert_eq!(ctx.stats().aborted, 1);
}
