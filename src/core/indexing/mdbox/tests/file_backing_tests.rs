use crate::core::common::{MdBoxError, NodeId};
use crate::core::indexing::mdbox::{BoxController, BoxTree, Extents, FileBackend, ImplicitFunction, MdEvent};
use crate::core::storage::engine::EventFile;
use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::OpenOptions;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn backed_tree(dir: &TempDir, threshold: usize, capacity: usize) -> Arc<BoxTree<2>> {
    let mut bc = BoxController::new(2).unwrap();
    bc.set_split_threshold(threshold).unwrap();
    bc.set_split_into_all(2).unwrap();
    bc.set_max_depth(6).unwrap();
    let file = EventFile::create(dir.path().join("events.bin"), 2).unwrap();
    Arc::new(
        BoxTree::with_file_backing(
            Extents::cube(0.0, 10.0).unwrap(),
            Arc::new(bc),
            FileBackend::new(file, capacity),
        )
        .unwrap(),
    )
}

fn random_events(n: u32, seed: u64) -> Vec<MdEvent<2>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let center = [rng.gen_range(0.0..10.0), rng.gen_range(0.0..10.0)];
            MdEvent::new(rng.gen_range(0.5..2.0), 0.1, center, 1, i)
        })
        .collect()
}

fn detector_ids(tree: &BoxTree<2>, id: NodeId) -> Vec<u32> {
    tree.events(id).unwrap().iter().map(|e| e.detector_id()).collect()
}

#[test]
fn test_file_dimensionality_must_match_tree() {
    let dir = tempdir().unwrap();
    let file = EventFile::create(dir.path().join("events.bin"), 3).unwrap();
    let err = BoxTree::<2>::with_file_backing(
        Extents::cube(0.0, 1.0).unwrap(),
        Arc::new(BoxController::new(2).unwrap()),
        FileBackend::new(file, 10),
    )
    .unwrap_err();
    assert!(matches!(err, MdBoxError::DimensionMismatch { expected: 2, actual: 3 }));
}

#[test]
fn test_evict_all_round_trip_preserves_events_and_aggregates() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 100, 1_000_000);
    tree.add_events(&random_events(1000, 1)).unwrap();
    tree.split_all_if_needed(None).unwrap();
    tree.refresh_cache().unwrap();

    let leaves = tree.leaves().unwrap();
    let before: Vec<_> = leaves
        .iter()
        .map(|leaf| (detector_ids(&tree, leaf.id()), leaf.aggregates().unwrap()))
        .collect();
    let non_empty = before.iter().filter(|(ids, _)| !ids.is_empty()).count();

    assert_eq!(tree.evict_all().unwrap(), non_empty);
    for leaf in &leaves {
        assert_eq!(leaf.is_resident().unwrap(), leaf.n_points().unwrap() == 0);
    }
    assert_eq!(tree.total_data_size().unwrap(), 1000);
    assert_eq!(tree.file_backend().unwrap().resident_events().unwrap(), 0);

    tree.refresh_cache().unwrap();
    assert_eq!(tree.n_points().unwrap(), 1000);
    for (leaf, (ids, aggregates)) in leaves.iter().zip(&before) {
        assert_eq!(leaf.aggregates().unwrap(), *aggregates);
        assert_eq!(&detector_ids(&tree, leaf.id()), ids);
    }
}

#[test]
fn test_queries_read_through_evicted_leaves() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 50, 1_000_000);
    tree.add_events(&random_events(600, 2)).unwrap();
    tree.split_all_if_needed(None).unwrap();
    tree.refresh_cache().unwrap();

    let sphere = ImplicitFunction::sphere([4.0, 6.0], 6.25);
    let region = Extents::new([(1.0, 7.5), (0.0, 3.0)]).unwrap();
    let sphere_before = tree.integrate(&sphere).unwrap();
    let region_before = tree.bin_region(&region).unwrap();
    assert!(sphere_before.n_events > 0);

    tree.evict_all().unwrap();
    let sphere_after = tree.integrate(&sphere).unwrap();
    let region_after = tree.bin_region(&region).unwrap();
    assert_eq!(sphere_after.n_events, sphere_before.n_events);
    assert_relative_eq!(sphere_after.signal, sphere_before.signal, max_relative = 1e-12);
    assert_relative_eq!(region_after.error_squared, region_before.error_squared, max_relative = 1e-12);
    assert_eq!(region_after.n_events, region_before.n_events);
}

#[test]
fn test_cache_capacity_evicts_least_recently_used_leaves() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 50, 100);
    tree.add_events(&random_events(1000, 3)).unwrap();
    tree.split_all_if_needed(None).unwrap();

    let backing = tree.file_backend().unwrap();
    assert!(backing.resident_events().unwrap() <= 100);
    let leaves = tree.leaves().unwrap();
    let evicted: Vec<_> = leaves.iter().filter(|l| !l.is_resident().unwrap()).collect();
    assert!(!evicted.is_empty());
    assert_eq!(tree.total_data_size().unwrap(), 1000);

    // Reading an evicted leaf brings it back and keeps the budget.
    let leaf = evicted[0];
    let events = tree.events(leaf.id()).unwrap();
    assert_eq!(events.len() as u64, leaf.n_points().unwrap());
    assert!(events.iter().all(|e| leaf.owns_point(e.center())));
    assert!(backing.resident_events().unwrap() <= 100);
}

#[test]
fn test_split_loads_evicted_leaf_with_pending_events() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 10, 1_000_000);
    tree.add_events(&random_events(8, 4)).unwrap();
    assert_eq!(tree.evict_all().unwrap(), 1);
    assert!(!tree.root().unwrap().is_resident().unwrap());

    let more: Vec<_> = random_events(5, 5).into_iter().map(|e| MdEvent::new(1.0, 0.1, *e.center(), 2, 0)).collect();
    tree.add_events(&more).unwrap();
    assert_eq!(tree.total_data_size().unwrap(), 13);

    tree.split_all_if_needed(None).unwrap();
    assert!(!tree.root().unwrap().is_leaf().unwrap());
    assert_eq!(tree.total_data_size().unwrap(), 13);
    let mut pending = 0;
    for leaf in tree.leaves().unwrap() {
        let events = tree.events(leaf.id()).unwrap();
        assert!(events.iter().all(|e| leaf.owns_point(e.center())));
        pending += events.iter().filter(|e| e.run_index() == 2).count();
    }
    assert_eq!(pending, 5);
    // The root's old rows are free for reuse.
    assert_eq!(tree.file_backend().unwrap().file().free_rows().unwrap(), 8);
}

#[test]
fn test_failed_load_leaves_leaf_untouched() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 100, 1_000_000);
    tree.add_events(&random_events(5, 6)).unwrap();
    tree.evict_all().unwrap();

    OpenOptions::new()
        .write(true)
        .open(dir.path().join("events.bin"))
        .unwrap()
        .set_len(0)
        .unwrap();

    let err = tree.events(NodeId::ROOT).unwrap_err();
    assert!(err.is_io());
    let root = tree.root().unwrap();
    assert!(!root.is_resident().unwrap());
    assert!(root.is_file_backed().unwrap());
    assert_eq!(root.n_points().unwrap(), 5);
    assert!(tree.integrate(&ImplicitFunction::sphere([5.0, 5.0], 1.0)).is_err());
}

#[test]
fn test_save_all_writes_only_dirty_leaves() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 100, 1_000_000);
    tree.add_events(&random_events(300, 7)).unwrap();
    tree.split_all_if_needed(None).unwrap();
    let non_empty = tree.leaves().unwrap().iter().filter(|l| l.n_points().unwrap() > 0).count();

    assert_eq!(tree.save_all().unwrap(), non_empty);
    assert!(tree.leaves().unwrap().iter().all(|l| l.is_resident().unwrap()));
    assert_eq!(tree.save_all().unwrap(), 0);

    tree.add_event(MdEvent::at([0.5, 0.5], 1.0, 1.0)).unwrap();
    assert_eq!(tree.save_all().unwrap(), 1);
    let file = tree.file_backend().unwrap().file();
    assert_eq!(file.len_rows().unwrap() - file.free_rows().unwrap(), 301);
}

#[test]
fn test_disk_operations_need_a_backing() {
    let tree = BoxTree::<2>::new(Extents::cube(0.0, 1.0).unwrap(), Arc::new(BoxController::new(2).unwrap())).unwrap();
    assert!(matches!(tree.save_all(), Err(MdBoxError::Configuration(_))));
    assert!(matches!(tree.evict_all(), Err(MdBoxError::Configuration(_))));
    tree.rebalance_cache().unwrap();
}

#[test]
fn test_clear_releases_every_extent() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 40, 1_000_000);
    tree.add_events(&random_events(200, 8)).unwrap();
    tree.split_all_if_needed(None).unwrap();
    tree.evict_all().unwrap();

    let mut tree = Arc::try_unwrap(tree).unwrap();
    tree.clear().unwrap();
    let backing = tree.file_backend().unwrap();
    assert_eq!(backing.file().free_rows().unwrap(), backing.file().len_rows().unwrap());
    assert_eq!(backing.resident_events().unwrap(), 0);
    assert_eq!(tree.num_nodes().unwrap(), 1);
    assert_eq!(tree.total_data_size().unwrap(), 0);
}

#[test]
fn test_plain_insertion_keeps_resident_events_within_capacity() {
    let dir = tempdir().unwrap();
    let tree = backed_tree(&dir, 1_000_000, 150);
    tree.split_box(NodeId::ROOT).unwrap();
    tree.add_events(&random_events(400, 9)).unwrap();

    let backing = tree.file_backend().unwrap();
    assert!(backing.resident_events().unwrap() <= 150);
    assert!(tree.leaves().unwrap().iter().any(|l| !l.is_resident().unwrap()));
    assert_eq!(tree.total_data_size().unwrap(), 400);

    let everything = tree.bin_region(&Extents::cube(0.0, 10.5).unwrap()).unwrap();
    assert_eq!(everything.n_events, 400);
    assert!(backing.resident_events().unwrap() <= 150);
}
