use crate::core::common::{MdBoxError, NodeId};
use crate::core::indexing::mdbox::{BoxController, BoxTree, Extents, MdEvent, NodeSlot};
use approx::assert_relative_eq;
use std::sync::Arc;

fn tree_2d(threshold: usize) -> BoxTree<2> {
    let mut bc = BoxController::new(2).unwrap();
    bc.set_split_threshold(threshold).unwrap();
    bc.set_split_into_all(2).unwrap();
    BoxTree::new(Extents::cube(0.0, 10.0).unwrap(), Arc::new(bc)).unwrap()
}

#[test]
fn test_new_tree_is_single_empty_root() {
    let tree = tree_2d(10);
    let root = tree.root().unwrap();
    assert_eq!(root.id(), NodeId::ROOT);
    assert_eq!(root.depth(), 0);
    assert_eq!(root.parent(), None);
    assert!(root.is_leaf().unwrap());
    assert_eq!(tree.num_nodes().unwrap(), 1);
    assert_eq!(tree.n_points().unwrap(), 0);
    assert_eq!(tree.controller().total_num_md_boxes(), 1);
}

#[test]
fn test_controller_dimensionality_must_match() {
    let bc = Arc::new(BoxController::new(3).unwrap());
    let err = BoxTree::<2>::new(Extents::cube(0.0, 1.0).unwrap(), bc).unwrap_err();
    assert!(matches!(err, MdBoxError::DimensionMismatch { expected: 2, actual: 3 }));
}

#[test]
fn test_out_of_extent_events_are_dropped_not_errors() {
    let tree = tree_2d(100);
    assert!(tree.add_event(MdEvent::at([1.0, 1.0], 1.0, 1.0)).unwrap());
    assert!(!tree.add_event(MdEvent::at([11.0, 1.0], 1.0, 1.0)).unwrap());
    assert!(!tree.add_event(MdEvent::at([-0.5, 1.0], 1.0, 1.0)).unwrap());
    assert!(!tree.add_event(MdEvent::at([f32::NAN, 1.0], 1.0, 1.0)).unwrap());
    // The global max is inside the last bin.
    assert!(tree.add_event(MdEvent::at([10.0, 10.0], 1.0, 1.0)).unwrap());

    let batch = vec![
        MdEvent::at([2.0, 2.0], 1.0, 1.0),
        MdEvent::at([2.0, 20.0], 1.0, 1.0),
        MdEvent::at([3.0, 3.0], 1.0, 1.0),
    ];
    assert_eq!(tree.add_events(&batch).unwrap(), 1);
    assert_eq!(tree.n_points().unwrap(), 4);
    assert_eq!(tree.total_data_size().unwrap(), 4);
}

#[test]
fn test_events_keep_submission_order_within_leaf() {
    let tree = tree_2d(100);
    let batch: Vec<_> = (0..5).map(|i| MdEvent::new(1.0, 1.0, [i as f32, 0.5], 0, i)).collect();
    tree.add_events(&batch).unwrap();
    let ids: Vec<u32> = tree.events(NodeId::ROOT).unwrap().iter().map(|e| e.detector_id()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_refresh_cache_is_idempotent() {
    let tree = tree_2d(3);
    for i in 0..20 {
        let x = (i % 10) as f32 + 0.25;
        let y = (i / 2) as f32 * 0.5;
        tree.add_event(MdEvent::at([x, y], 1.0 + i as f64, 0.1 * i as f64)).unwrap();
    }
    tree.split_box(NodeId::ROOT).unwrap();
    tree.refresh_cache().unwrap();
    let root = tree.root().unwrap();
    let first = (root.signal().unwrap(), root.error_squared().unwrap(), root.centroid().unwrap());
    tree.refresh_cache().unwrap();
    let second = (root.signal().unwrap(), root.error_squared().unwrap(), root.centroid().unwrap());
    assert_eq!(first, second);
    assert_relative_eq!(first.0, (1..=20).sum::<i32>() as f64);
    assert_eq!(root.n_points().unwrap(), 20);
}

#[test]
fn test_grid_n_points_is_sum_of_children_after_refresh() {
    let tree = tree_2d(1000);
    for i in 0..40 {
        tree.add_event(MdEvent::at([(i % 10) as f32, (i / 4) as f32], 1.0, 1.0)).unwrap();
    }
    tree.split_box(NodeId::ROOT).unwrap();
    tree.refresh_cache().unwrap();
    let root = tree.root().unwrap();
    let children = match &*root.read().unwrap() {
        NodeSlot::Grid(grid) => grid.children().to_vec(),
        NodeSlot::Box(_) => panic!("root should be a grid"),
    };
    let sum: u64 = children.iter().map(|&c| tree.node(c).unwrap().n_points().unwrap()).sum();
    assert_eq!(root.n_points().unwrap(), sum);
    assert_eq!(sum, 40);
}

#[test]
fn test_mask_applies_to_descendants() {
    let tree = tree_2d(1000);
    tree.add_event(MdEvent::at([1.0, 1.0], 1.0, 1.0)).unwrap();
    tree.split_box(NodeId::ROOT).unwrap();
    let child = NodeId(1);
    assert!(!tree.is_masked(child).unwrap());
    tree.mask(NodeId::ROOT).unwrap();
    assert!(tree.is_masked(child).unwrap());
    assert!(!tree.node(child).unwrap().is_masked());
    tree.unmask(NodeId::ROOT).unwrap();
    assert!(!tree.is_masked(child).unwrap());
}

#[test]
fn test_unknown_node_is_an_error() {
    let tree = tree_2d(10);
    assert!(matches!(tree.node(NodeId(42)), Err(MdBoxError::NodeNotFound(NodeId(42)))));
    assert!(tree.mask(NodeId(42)).is_err());
}

#[test]
fn test_events_of_grid_is_rejected() {
    let tree = tree_2d(10);
    tree.split_box(NodeId::ROOT).unwrap();
    let err = tree.events(NodeId::ROOT).unwrap_err();
    assert!(matches!(err, MdBoxError::UnexpectedNodeType { id: NodeId::ROOT, .. }));
}

#[test]
fn test_controller_is_frozen_once_events_arrive() {
    let mut tree = tree_2d(10);
    tree.controller_mut().unwrap().set_split_threshold(5).unwrap();
    assert_eq!(tree.controller().split_threshold(), 5);

    tree.add_event(MdEvent::at([1.0, 1.0], 1.0, 1.0)).unwrap();
    assert!(matches!(tree.controller_mut(), Err(MdBoxError::Configuration(_))));

    let shared = Arc::new(BoxController::new(2).unwrap());
    let mut other = BoxTree::<2>::new(Extents::cube(0.0, 1.0).unwrap(), Arc::clone(&shared)).unwrap();
    assert!(matches!(other.controller_mut(), Err(MdBoxError::Configuration(_))));
}

#[test]
fn test_clear_resets_to_empty_root() {
    let mut tree = tree_2d(2);
    for i in 0..10 {
        tree.add_event(MdEvent::at([i as f32, i as f32], 1.0, 1.0)).unwrap();
    }
    tree.split_box(NodeId::ROOT).unwrap();
    assert_eq!(tree.num_nodes().unwrap(), 5);
    tree.clear().unwrap();
    assert_eq!(tree.num_nodes().unwrap(), 1);
    assert_eq!(tree.total_data_size().unwrap(), 0);
    assert!(tree.root().unwrap().is_leaf().unwrap());
    assert_eq!(tree.controller().total_num_md_boxes(), 1);
    assert_eq!(tree.extents().unwrap(), Extents::cube(0.0, 10.0).unwrap());
}

#[test]
fn test_insertion_marks_every_ancestor_stale() {
    let tree = tree_2d(1000);
    tree.add_event(MdEvent::at([1.0, 1.0], 1.0, 1.0)).unwrap();
    tree.add_event(MdEvent::at([7.0, 7.0], 1.0, 1.0)).unwrap();
    tree.split_box(NodeId::ROOT).unwrap();
    // NodeId(2) covers [5, 10) x [0, 5); its children are 5..=8.
    tree.split_box(NodeId(2)).unwrap();
    tree.refresh_cache().unwrap();
    let root = tree.root().unwrap();
    let grid = tree.node(NodeId(2)).unwrap();
    assert!(!root.is_stale().unwrap());
    assert!(!grid.is_stale().unwrap());
    assert_eq!(root.n_points().unwrap(), 2);

    tree.add_event(MdEvent::at([6.0, 1.0], 1.0, 1.0)).unwrap();
    assert!(tree.node(NodeId(5)).unwrap().is_stale().unwrap());
    assert!(grid.is_stale().unwrap());
    assert!(root.is_stale().unwrap());
    assert!(!tree.node(NodeId(1)).unwrap().is_stale().unwrap());

    let summary = &tree.get_boxes(0, false, None).unwrap()[0];
    assert!(summary.stale);
    assert_eq!(summary.n_points, 2);

    tree.refresh_cache().unwrap();
    assert!(!root.is_stale().unwrap());
    assert!(!grid.is_stale().unwrap());
    assert_eq!(root.n_points().unwrap(), 3);
    assert!(!tree.get_boxes(0, false, None).unwrap()[0].stale);
}

#[test]
fn test_unlocked_appends_mark_ancestors_stale() {
    let tree = tree_2d(1000);
    tree.split_box(NodeId::ROOT).unwrap();
    tree.refresh_cache().unwrap();
    assert!(!tree.root().unwrap().is_stale().unwrap());

    let leaf = tree.node(NodeId(1)).unwrap();
    {
        let mut writer = leaf.lock_box().unwrap();
        assert_eq!(writer.add_events_unsafe(&[MdEvent::at([1.0, 1.0], 1.0, 1.0)]), 0);
    }
    assert!(tree.root().unwrap().is_stale().unwrap());
    tree.refresh_cache().unwrap();
    assert!(!tree.root().unwrap().is_stale().unwrap());
    assert_eq!(tree.n_points().unwrap(), 1);
}
