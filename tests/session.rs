use std::sync::{Arc, Mutex};

use labelfe::label::Axis;
use labelfe::prelude::*;
use tempfile::TempDir;

/// 128×128×2 volume of fragment ids 10, 11 and 12 in vertical bands.
fn banded_labels() -> DenseVolume {
    let extent = Extent::new([128, 128, 2]);
    let mut vol = DenseVolume::filled(extent, [64, 64, 1], 10);
    for z in 0..2 {
        for y in 0..128 {
            for x in 40..128 {
                vol.set([x, y, z], if x < 80 { 11 } else { 12 }).unwrap();
            }
        }
    }
    vol
}

fn settings() -> Settings {
    Settings {
        chunk_shape: [32, 32, 1],
        brush_radius: 2.0,
        brush_shape: BrushShape::Disc(Axis::Z),
        connectivity: Connectivity::Plane(Axis::Z),
        flatten_batch_chunks: 5,
        ..Settings::default()
    }
}

#[test]
fn merge_detach_scenario() {
    let dir = TempDir::new().unwrap();
    let p = Project::create(&dir.path().join("p"), &banded_labels(), settings()).unwrap();

    assert_eq!(p.merge(10, 11, None).unwrap().unwrap().segment, 11);
    assert_eq!(p.segment(10), 11);
    assert_eq!(p.segment(11), 11);
    assert_eq!(p.segment(12), 12);

    assert_eq!(p.merge(11, 12, None).unwrap().unwrap().segment, 12);
    let fresh = p.detach(10).unwrap().unwrap().segment;
    assert_eq!(fresh, 13);
    assert_eq!(p.segment(10), 13);
    assert_eq!(p.segment(11), 12);
    assert_eq!(p.segment(12), 12);
}

#[test]
fn brush_scenario_falls_back_to_base() {
    let dir = TempDir::new().unwrap();
    let p = Project::create(&dir.path().join("p"), &banded_labels(), settings()).unwrap();
    let change = p.paint_brush([5, 5, 0], PaintMode::Label(7)).unwrap();
    assert_eq!(change.affected, 13);
    assert_eq!(p.read_voxel([5, 5, 0]).unwrap(), 7);
    assert_eq!(p.read_voxel([100, 100, 0]).unwrap(), 12);
    assert_eq!(p.read_voxel([5, 5, 1]).unwrap(), 10);
}

#[test]
fn edit_persist_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("p");
    let changes = Arc::new(Mutex::new(Vec::new()));

    {
        let p = Project::create(&path, &banded_labels(), settings()).unwrap();
        let sink = changes.clone();
        p.subscribe(move |c| sink.lock().unwrap().push(c.clone()));

        let label = p.next_paint_id().unwrap();
        assert_eq!(label, 13);
        // Fill band 10 in plane z=0 only.
        let filled = p.fill([0, 0, 0], PaintMode::Label(label)).unwrap();
        assert_eq!(filled.affected(), 40 * 128);
        p.merge(11, 12, Some(11)).unwrap();

        // Paint 13 bleeds into band 11; restrict from inside band 11 carves it.
        p.paint_voxel([40, 3, 0], PaintMode::Label(label)).unwrap();
        let carved = p.restrict([60, 3, 0]).unwrap();
        assert!(carved.affected() >= 1);
        assert_eq!(p.read_voxel([40, 3, 0]).unwrap(), 11);

        assert!(p.is_dirty());
        p.persist().unwrap();
        assert!(!p.is_dirty());
        assert!(changes.lock().unwrap().len() >= 3);
    }

    let p = Project::open(&path, settings()).unwrap();
    assert_eq!(p.segment(12), 11);
    assert_eq!(p.read_voxel([40, 3, 0]).unwrap(), 11);
    assert_eq!(p.read_voxel([0, 127, 1]).unwrap(), 10);
    assert_eq!(p.next_paint_id().unwrap(), 14);
    let lut = p.export_lookup_table();
    assert_eq!(lut, LookupTable::new(vec![12], vec![11]));
}

#[test]
fn concurrent_persist_is_rejected_or_serialized() {
    let dir = TempDir::new().unwrap();
    let p = Project::create(&dir.path().join("p"), &banded_labels(), settings()).unwrap();
    p.paint_voxel([1, 1, 1], PaintMode::Label(99)).unwrap();

    let a = p.spawn_persist(None);
    let b = p.spawn_persist(None);
    let results = [a.wait(), b.wait()];
    assert!(results.iter().any(|r| r.is_ok()));
    for r in &results {
        if let Err(e) = r {
            assert!(matches!(e, LabelError::Busy));
        }
    }
}
