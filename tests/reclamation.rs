//! Reclamation engine scenarios
//!
//! Deterministic catalog fixtures driven through whole collect passes
//! against the recording fake daemon.

mod common;

use common::{seeded_root, Fixture, StorageBuilder};
use snaptree::{
    recycle_root_ident, HashKind, HostSnapshotKind, JournalPayload, LocatorId, StorageStatus,
};

#[test]
fn test_empty_root_is_invalidated() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::Md4Crc32);

    let did_work = fixture.service.collect_root(root).unwrap();
    assert!(!did_work);
    assert!(!fixture.catalog().snapshot().root(root).unwrap().valid);

    // the locker is gone with the root: another pass cannot start
    assert!(fixture.service.collect_root(root).is_err());
}

#[test]
fn test_recycle_root_cleanup_with_work_dedup() {
    let fixture = Fixture::new();
    let recycle = recycle_root_ident();
    let catalog = fixture.catalog();

    // one qcow file whose two snapshots are both condemned
    let a_path = fixture.touch("a.qcow");
    let a1 = StorageBuilder::qcow(recycle, &a_path)
        .status(StorageStatus::Recycling)
        .insert(catalog);
    let a2 = StorageBuilder::qcow(recycle, &a_path)
        .status(StorageStatus::Recycling)
        .insert(catalog);

    // one qcow file that still hosts a live snapshot of another tree
    let b_path = fixture.touch("b.qcow");
    let other_root = seeded_root(&fixture, HashKind::None);
    let b_live = StorageBuilder::qcow(other_root, &b_path).insert(catalog);
    let b1 = StorageBuilder::qcow(recycle, &b_path)
        .status(StorageStatus::Recycling)
        .insert(catalog);

    // a cdp file, plus a storage that is still referenced by a reader
    let c_path = fixture.touch("c.cdp");
    let c1 = StorageBuilder::cdp(recycle, &c_path)
        .status(StorageStatus::Recycling)
        .insert(catalog);
    let d_path = fixture.touch("d.qcow");
    let d1 = StorageBuilder::qcow(recycle, &d_path)
        .status(StorageStatus::Recycling)
        .insert(catalog);
    fixture
        .service
        .references()
        .add_reading("external-reader", &[fixture.storage(d1.ident)])
        .unwrap();

    let did_work = fixture.service.collect_root(recycle).unwrap();
    assert!(did_work);

    // whole-file deletes collapsed into one work per file
    assert!(!a_path.exists());
    assert!(!c_path.exists());
    assert!(b_path.exists());
    assert!(d_path.exists());
    assert_eq!(
        fixture.images.deleted_qcow_snapshots(),
        vec![b1.ident.to_string()]
    );

    for ident in [a1.ident, a2.ident, b1.ident, c1.ident] {
        assert_eq!(fixture.storage_status(ident), StorageStatus::Recycled);
    }
    // the referenced storage was not touched
    assert_eq!(fixture.storage_status(d1.ident), StorageStatus::Recycling);
    assert_eq!(fixture.storage_status(b_live.ident), StorageStatus::Storage);
}

#[test]
fn test_tail_delete_after_host_snapshot_invalidated() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::None);
    let catalog = fixture.catalog();

    let root_path = fixture.touch("base.qcow");
    let base_locator = LocatorId(1);
    let base = StorageBuilder::qcow(root, &root_path)
        .locator(base_locator)
        .span(100, 100)
        .insert(catalog);
    fixture.host_snapshot(HostSnapshotKind::Normal, true, 100, 100, &[base_locator]);

    let tail_locator = LocatorId(2);
    let a = StorageBuilder::cdp(root, &fixture.touch("a.cdp"))
        .parent(base.ident)
        .locator(tail_locator)
        .span(1000, 1200)
        .insert(catalog);
    let b = StorageBuilder::cdp(root, &fixture.touch("b.cdp"))
        .parent(a.ident)
        .locator(tail_locator)
        .span(1200, 1400)
        .insert(catalog);
    let c = StorageBuilder::cdp(root, &fixture.touch("c.cdp"))
        .parent(b.ident)
        .locator(tail_locator)
        .span(1400, 1500)
        .insert(catalog);
    let t = StorageBuilder::qcow(root, &fixture.touch("t.qcow"))
        .parent(c.ident)
        .locator(tail_locator)
        .span(1500, 1500)
        .insert(catalog);

    let tail_host =
        fixture.host_snapshot(HostSnapshotKind::Cdp, true, 1000, 1500, &[tail_locator]);

    // while the host snapshot is valid nothing is reclaimable
    assert!(!fixture.service.collect_root(root).unwrap());

    fixture.invalidate_host_snapshot(tail_host);
    let did_work = fixture.service.collect_root(root).unwrap();
    assert!(did_work);

    for ident in [a.ident, b.ident, c.ident, t.ident] {
        assert_eq!(fixture.storage_status(ident), StorageStatus::Recycled);
    }
    assert_eq!(fixture.storage_status(base.ident), StorageStatus::Storage);
    assert!(!fixture.path("a.cdp").exists());
    assert!(!fixture.path("b.cdp").exists());
    assert!(!fixture.path("c.cdp").exists());
    assert!(!fixture.path("t.qcow").exists());
    assert!(root_path.exists());

    // the pass is idempotent-safe: nothing further to do
    assert!(!fixture.service.collect_root(root).unwrap());
}

/// Head of a CDP stream becomes obsolete: one pass folds it into a new
/// QCOW snapshot, the next deletes the folded file, a third merges the old
/// root away into the recycle root.
#[test]
fn test_cdp_head_merge_then_delete_then_root_merge() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::Md4Crc32);
    let catalog = fixture.catalog();

    let f7 = fixture.touch("f7.qcow");
    let l7 = LocatorId(7);
    let s7 = StorageBuilder::qcow(root, &f7)
        .locator(l7)
        .span(100, 100)
        .inc_hash()
        .insert(catalog);
    let hs7 = fixture.host_snapshot(HostSnapshotKind::Normal, true, 100, 100, &[l7]);

    let l8 = LocatorId(8);
    let s8 = StorageBuilder::cdp(root, &fixture.touch("f8.cdp"))
        .parent(s7.ident)
        .locator(l8)
        .span(100, 300)
        .insert(catalog);
    let hs8 = fixture.host_snapshot(HostSnapshotKind::Cdp, true, 100, 300, &[l8]);

    let l9 = LocatorId(9);
    let s9 = StorageBuilder::cdp(root, &fixture.touch("f9.cdp"))
        .parent(s8.ident)
        .locator(l9)
        .span(300, 500)
        .insert(catalog);
    fixture.host_snapshot(HostSnapshotKind::Cdp, true, 300, 500, &[l9]);

    let l10 = LocatorId(10);
    let s10 = StorageBuilder::qcow(root, &fixture.touch("f10.qcow"))
        .parent(s9.ident)
        .locator(l10)
        .span(500, 500)
        .insert(catalog);
    fixture.host_snapshot(HostSnapshotKind::Normal, true, 500, 500, &[l10]);

    fixture.invalidate_host_snapshot(hs7);
    fixture.invalidate_host_snapshot(hs8);

    // pass 1: the obsolete cdp head is folded into a new qcow snapshot
    assert!(fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.images.merge_cdp_requests().len(), 1);

    let merged_target = fixture
        .catalog()
        .snapshot()
        .storages_for_root(root)
        .into_iter()
        .find(|s| s.parent_ident == Some(s7.ident) && s.ident != s8.ident)
        .expect("merge target created under the old root");
    assert_eq!(merged_target.status, StorageStatus::Storage);
    assert_eq!(merged_target.image_path, f7);
    assert_eq!(merged_target.begin_timestamp, 300);
    assert_eq!(fixture.storage(s9.ident).parent_ident, Some(merged_target.ident));
    assert_eq!(fixture.storage_status(s8.ident), StorageStatus::Recycling);
    assert_eq!(fixture.storage(s8.ident).locator_id, None);

    // pass 2: the folded cdp file is now an unreferenced leaf
    assert!(fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage_status(s8.ident), StorageStatus::Recycled);
    assert!(!fixture.path("f8.cdp").exists());

    // pass 3: the obsolete root merges away; its child becomes the root
    assert!(fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage(s7.ident).root_id, recycle_root_ident());
    assert_eq!(fixture.storage(merged_target.ident).parent_ident, None);
    assert_eq!(fixture.images.hash_merges().len(), 1);

    // recycle-root pass: the detached node shares its file with the live
    // merge target, so only its snapshot is deleted
    assert!(fixture.service.collect_root(recycle_root_ident()).unwrap());
    assert_eq!(fixture.storage_status(s7.ident), StorageStatus::Recycled);
    assert_eq!(
        fixture.images.deleted_qcow_snapshots(),
        vec![s7.ident.to_string()]
    );
    assert!(f7.exists());
    assert_eq!(fixture.storage_status(s10.ident), StorageStatus::Storage);
}

#[test]
fn test_writing_parent_file_blocks_delete() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::None);
    let catalog = fixture.catalog();

    let shared = fixture.touch("shared.qcow");
    let parent = StorageBuilder::qcow(root, &shared).insert(catalog);
    let child = StorageBuilder::qcow(root, &shared)
        .parent(parent.ident)
        .insert(catalog);

    // an active writer holds the shared image file
    let writer_record = fixture.storage(child.ident);
    fixture
        .service
        .references()
        .add_writing("active-writer", &writer_record)
        .unwrap();

    assert!(!fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage_status(parent.ident), StorageStatus::Storage);
    assert_eq!(fixture.storage_status(child.ident), StorageStatus::Storage);

    fixture.service.references().remove_writing("active-writer");
    assert!(fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage_status(parent.ident), StorageStatus::Recycled);
    assert_eq!(fixture.storage_status(child.ident), StorageStatus::Recycled);
    assert!(!shared.exists());
}

#[test]
fn test_cross_file_merge_moves_snapshot_into_parent_file() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::None);
    let catalog = fixture.catalog();

    let fp = fixture.touch("parent.qcow");
    let fm = fixture.touch("middle.qcow");
    let fc = fixture.touch("child.qcow");

    let parent = StorageBuilder::qcow(root, &fp).span(100, 100).insert(catalog);
    let middle = StorageBuilder::qcow(root, &fm)
        .parent(parent.ident)
        .span(200, 200)
        .insert(catalog);
    let live_locator = LocatorId(1);
    let child = StorageBuilder::qcow(root, &fc)
        .parent(middle.ident)
        .locator(live_locator)
        .span(300, 300)
        .insert(catalog);
    fixture.host_snapshot(HostSnapshotKind::Normal, true, 300, 300, &[live_locator]);

    assert!(fixture.service.collect_root(root).unwrap());

    let requests = fixture.images.merge_type_b_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].prev_ident, parent.ident.to_string());
    assert_eq!(requests[0].current_ident, middle.ident.to_string());
    assert_eq!(requests[0].new_file, fp);

    let target = fixture
        .catalog()
        .snapshot()
        .storage(fixture.storage(child.ident).parent_ident.unwrap())
        .unwrap();
    assert_eq!(target.image_path, fp);
    assert_eq!(target.status, StorageStatus::Storage);
    assert_eq!(fixture.storage_status(middle.ident), StorageStatus::Recycling);

    // next pass deletes the emptied middle file
    assert!(fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage_status(middle.ident), StorageStatus::Recycled);
    assert!(!fm.exists());
}

#[test]
fn test_failed_cdp_merge_marks_target_exception() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::None);
    let catalog = fixture.catalog();

    let s_root = StorageBuilder::qcow(root, &fixture.touch("r.qcow"))
        .span(100, 100)
        .insert(catalog);
    let head_locator = LocatorId(1);
    let head = StorageBuilder::cdp(root, &fixture.touch("head.cdp"))
        .parent(s_root.ident)
        .locator(head_locator)
        .span(100, 300)
        .insert(catalog);
    let live_locator = LocatorId(2);
    let tail = StorageBuilder::cdp(root, &fixture.touch("tail.cdp"))
        .parent(head.ident)
        .locator(live_locator)
        .span(300, 500)
        .insert(catalog);
    fixture.host_snapshot(HostSnapshotKind::Cdp, true, 300, 500, &[live_locator]);
    let _ = tail;

    fixture.images.fail_merge_cdp_with(1);
    let did_work = fixture.service.collect_root(root).unwrap();
    assert!(!did_work);

    let target = fixture
        .catalog()
        .snapshot()
        .storages_for_root(root)
        .into_iter()
        .find(|s| s.parent_ident == Some(s_root.ident) && s.ident != head.ident)
        .expect("merge target row exists");
    assert_eq!(target.status, StorageStatus::Exception);
    // the marker survives for the next pass
    assert_eq!(fixture.storage_status(head.ident), StorageStatus::Recycling);
}

#[test]
fn test_destroy_journal_severs_locator_and_frees_storage() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::None);
    let catalog = fixture.catalog();

    let base = StorageBuilder::qcow(root, &fixture.touch("base.qcow"))
        .span(100, 100)
        .insert(catalog);
    let locator = LocatorId(1);
    let leaf = StorageBuilder::qcow(root, &fixture.touch("leaf.qcow"))
        .parent(base.ident)
        .locator(locator)
        .span(200, 200)
        .insert(catalog);
    fixture.host_snapshot(HostSnapshotKind::Normal, true, 200, 200, &[locator]);

    // the valid host snapshot pins the leaf
    assert!(!fixture.service.collect_root(root).unwrap());

    fixture
        .service
        .append_journal(
            root,
            JournalPayload::Destroy {
                idents: vec![leaf.ident],
            },
        )
        .unwrap();

    assert!(fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage_status(leaf.ident), StorageStatus::Recycled);
    assert!(!fixture.path("leaf.qcow").exists());
}

#[test]
fn test_file_level_dedup_storage_is_never_merged() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::None);
    let catalog = fixture.catalog();

    let shared = fixture.touch("dedup.qcow");
    let base = StorageBuilder::qcow(root, &shared).dedup().insert(catalog);
    let live_locator = LocatorId(1);
    let leaf = StorageBuilder::qcow(root, &shared)
        .parent(base.ident)
        .locator(live_locator)
        .span(300, 300)
        .insert(catalog);
    fixture.host_snapshot(HostSnapshotKind::Normal, true, 300, 300, &[live_locator]);
    let _ = leaf;

    assert!(!fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage_status(base.ident), StorageStatus::Storage);
}

#[test]
fn test_pending_journal_child_blocks_delete() {
    let fixture = Fixture::new();
    let root = seeded_root(&fixture, HashKind::None);
    let catalog = fixture.catalog();

    let base = StorageBuilder::qcow(root, &fixture.touch("base.qcow"))
        .span(100, 100)
        .insert(catalog);
    let leaf = StorageBuilder::qcow(root, &fixture.touch("leaf.qcow"))
        .parent(base.ident)
        .span(200, 200)
        .insert(catalog);

    // an unconsumed create journal hangs a prospective child off the leaf
    fixture
        .service
        .append_journal(
            root,
            JournalPayload::NormalCreate {
                new_ident: snaptree::StorageIdent::new(),
                parent_ident: Some(leaf.ident),
                parent_timestamp: None,
                kind: snaptree::StorageKind::Qcow,
                disk_bytes: 1 << 30,
                storage_folder: fixture.dir.clone(),
            },
        )
        .unwrap();

    assert!(!fixture.service.collect_root(root).unwrap());
    assert_eq!(fixture.storage_status(leaf.ident), StorageStatus::Storage);
}
