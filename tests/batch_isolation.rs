//! Batch application, scene-graph scans and layer isolation together.

use std::sync::Arc;

use blockclip::document::Entity;
use blockclip::sim::{SimDocument, SimHost};
use blockclip::{
    BatchCoordinator, ClipApplier, ClipConfig, DetectionMethod, Extents, InstanceId,
    IsolationProjector, ManualClock, SceneGraphTraverser, Status, Verbosity,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn site_plan(count: usize) -> (ManualClock, SimHost, Vec<InstanceId>) {
    init_tracing();
    let clock = ManualClock::new();
    let doc = SimDocument::with_clock(clock.clone());
    let mut ids = Vec::new();
    for i in 0..count {
        let name = format!("BLDG_{}", i + 1);
        doc.add_definition(&name, vec![Entity::geometry(format!("OUTLINE_{}", i + 1))]);
        let id = doc.add_top_level(&name, "SITE");
        let x = i as f64 * 50.0;
        doc.set_extents(id, Some(Extents::from_coords(x, 0.0, x + 40.0, 30.0)));
        ids.push(id);
    }
    (clock, SimHost::new(doc), ids)
}

fn coordinator(clock: &ManualClock) -> BatchCoordinator {
    BatchCoordinator::new(ClipApplier::new(ClipConfig::default()).with_clock(Arc::new(clock.clone())))
}

#[test]
fn one_faulting_instance_does_not_stop_the_batch() {
    let (clock, host, ids) = site_plan(5);
    host.document().panic_on_read(ids[2]);

    let out = coordinator(&clock).apply_all(host.document(), &host, &ids);
    assert_eq!(out.status, Status::Success);
    let tally = out.data.unwrap();
    assert_eq!((tally.succeeded, tally.failed), (4, 1));
    assert_eq!(tally.failed_names, vec![ids[2].to_string()]);

    // Instances after the faulting one were still processed.
    assert!(host.document().clip_boundary(ids[3]).is_some());
    assert!(host.document().clip_boundary(ids[4]).is_some());
    assert!(host.selection().is_empty());
    assert_eq!(host.subscriber_count(), 0);
    assert_eq!(host.document().open_scopes(), 0);
}

#[test]
fn rerunning_a_batch_issues_no_new_commands() {
    let (clock, host, ids) = site_plan(3);
    let batch = coordinator(&clock);
    batch.apply_all(host.document(), &host, &ids);
    let issued = host.commands().len();

    let again = batch.apply_all(host.document(), &host, &ids);
    assert_eq!(again.data.unwrap().succeeded, 3);
    assert_eq!(host.commands().len(), issued);
}

#[test]
fn depth_bound_skips_the_sixth_level() {
    init_tracing();
    let doc = SimDocument::new();
    for level in 0..6 {
        doc.add_definition(&format!("L{level}"), vec![]);
    }
    let root = doc.add_top_level("L0", "0");
    let mut chain = vec![root];
    for level in 1..6 {
        chain.push(doc.add_nested(&format!("L{}", level - 1), &format!("L{level}"), "0"));
    }
    for &id in &chain {
        doc.mark_clipped(id);
    }

    let out = SceneGraphTraverser::new(&ClipConfig::default()).traverse_document(&doc);
    assert!(out.is_success());
    let t = out.data.unwrap();
    assert_eq!(t.processed, 6);
    assert_eq!(t.skipped, 1);
    let levels: Vec<usize> = t.records.iter().map(|r| r.nest_level).collect();
    assert_eq!(levels, vec![0, 1, 2, 3, 4]);
    assert!(!t.records.iter().any(|r| r.instance == chain[5]));
}

#[test]
fn self_nesting_definition_terminates() {
    let doc = SimDocument::new();
    doc.add_definition("LOOP", vec![]);
    let top = doc.add_top_level("LOOP", "0");
    // LOOP contains an instance of LOOP.
    doc.add_nested("LOOP", "LOOP", "0");

    let cfg = ClipConfig::default().with_max_nest_depth(3);
    let t = SceneGraphTraverser::new(&cfg)
        .traverse(&doc, &[top])
        .data
        .unwrap();
    // Levels 0, 1, 2 are visited; the instance at level 3 is skipped.
    assert_eq!(t.processed, 4);
    assert_eq!(t.skipped, 1);
}

#[test]
fn clip_scan_then_isolate() {
    let (clock, host, ids) = site_plan(4);
    let doc = host.document();
    doc.add_layer("ANNOTATION", true);

    let batch = coordinator(&clock);
    let out = batch.apply_by_name(doc, &host, &ids, |n| n == "BLDG_2" || n == "BLDG_4");
    assert_eq!(out.data.unwrap().succeeded, 2);

    let scan = SceneGraphTraverser::new(&ClipConfig::default().with_verbosity(Verbosity::Quiet))
        .traverse_document(doc);
    let traversal = scan.data.unwrap();
    let names: Vec<&str> = traversal
        .records
        .iter()
        .map(|r| r.definition_name.as_str())
        .collect();
    assert_eq!(names, vec!["BLDG_2", "BLDG_4"]);
    assert_eq!(
        traversal.by_method().get(&DetectionMethod::FilterSpatialEntry),
        Some(&2)
    );

    let isolated = IsolationProjector::new(Verbosity::Normal)
        .with_clock(Arc::new(clock.clone()))
        .isolate(doc, &traversal.records);
    assert!(isolated.is_success());
    assert_eq!(isolated.data, Some(3));
    assert_eq!(doc.layer_visible("SITE"), Some(true));
    assert_eq!(doc.layer_visible("OUTLINE_2"), Some(true));
    assert_eq!(doc.layer_visible("OUTLINE_4"), Some(true));
    assert_eq!(doc.layer_visible("OUTLINE_1"), Some(false));
    assert_eq!(doc.layer_visible("ANNOTATION"), Some(false));
    assert_eq!(doc.layer_visible("0"), Some(false));
}

#[test]
fn scan_of_unclipped_drawing_hints_instead_of_failing() {
    let (_clock, host, _ids) = site_plan(2);
    let out = SceneGraphTraverser::new(&ClipConfig::default()).traverse_document(host.document());
    assert!(out.is_success());
    assert!(out.message.starts_with("found 0 clipped instance(s); processed 2, skipped 0"));
    assert!(out.message.contains("clip an instance first"));
}
