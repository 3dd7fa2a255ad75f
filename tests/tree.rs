// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use regex::Regex;
use sdt::backend::{Backend, FdtBackend, SourceBackend};
use sdt::codec::{PropertyType, Value};
use sdt::export::{GenericTree, LABEL_KEY};
use sdt::tree::NodeState;
use sdt::{Config, Error, Registries, Tree};
use sdt_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A packed blob: every edit that adds bytes runs out of space first.
fn board() -> Vec<u8> {
    DeviceTree::new(
        DeviceTreeNode::builder("")
            .strings("compatible", &["acme,board"])
            .cells("#address-cells", &[1])
            .cells("#size-cells", &[1])
            .child(
                DeviceTreeNode::builder("soc")
                    .cells("#address-cells", &[1])
                    .cells("#size-cells", &[1])
                    .child(
                        DeviceTreeNode::builder("intc@f000")
                            .strings("compatible", &["acme,intc"])
                            .property(DeviceTreeProperty::new("interrupt-controller", Vec::new()))
                            .cells("#interrupt-cells", &[1])
                            .cells("phandle", &[1])
                            .build(),
                    )
                    .child(
                        DeviceTreeNode::builder("uart@1000")
                            .strings("compatible", &["acme,uart", "ns16550a"])
                            .cells("reg", &[0x1000, 0x100])
                            .cells("interrupt-parent", &[1])
                            .strings("status", &["okay"])
                            .child(DeviceTreeNode::builder("port").build())
                            .build(),
                    )
                    .build(),
            )
            .child(
                DeviceTreeNode::builder("spare")
                    .strings("status", &["disabled"])
                    .build(),
            )
            .build(),
    )
    .to_dtb()
}

fn open(bytes: &[u8]) -> Tree<'static> {
    Tree::new(Box::new(FdtBackend::from_bytes(bytes).unwrap())).unwrap()
}

/// Every live node with its properties, in tree order.
fn listing(tree: &Tree<'_>) -> Vec<(String, Vec<(String, Vec<Value>)>)> {
    tree.nodes()
        .map(|node| {
            let properties = node
                .properties()
                .map(|property| (property.name().to_owned(), property.values().to_vec()))
                .collect();
            (node.path().to_owned(), properties)
        })
        .collect()
}

#[test]
fn round_trip() {
    init();
    let mut tree = open(&board());
    let before = listing(&tree);
    assert_eq!(before.len(), 6);

    tree.sync().unwrap();
    tree.resolve().unwrap();
    assert_eq!(listing(&tree), before);
    assert!(!tree.is_dirty());

    let reopened = open(&tree.to_dtb().unwrap());
    assert_eq!(listing(&reopened), before);
}

#[test]
fn resolve_is_idempotent() {
    init();
    let mut tree = open(&board());
    let uart = tree.node_by_path("/soc/uart@1000").unwrap();
    tree.resolve().unwrap();
    let once = listing(&tree);
    tree.resolve().unwrap();
    assert_eq!(listing(&tree), once);
    assert_eq!(tree.node_by_path("/soc/uart@1000"), Some(uart));
}

#[test]
fn lookups() {
    init();
    let tree = open(&board());
    let intc = tree.node_by_path("/soc/intc@f000").unwrap();
    assert_eq!(tree.node_by_phandle(1), Some(intc));
    assert_eq!(tree.lookup("/soc/intc@f000"), Some(intc));
    assert_eq!(tree.deref(&Value::Int(1)), Some(intc));
    assert_eq!(tree.deref(&Value::Int(0)), None);

    let uarts = tree.nodes_compatible(&Regex::new("ns16550").unwrap());
    assert_eq!(uarts, [tree.node_by_path("/soc/uart@1000").unwrap()]);
    let under_soc = tree.nodes_matching(&Regex::new("^/soc/").unwrap());
    assert_eq!(under_soc.len(), 3);

    let soc = tree.node_by_path("/soc").unwrap();
    assert_eq!(tree.child_paths(soc), ["/soc/intc@f000", "/soc/uart@1000"]);
    assert_eq!(tree.subnodes(soc).len(), 4);

    let uart = tree.node(uarts[0]).unwrap();
    assert_eq!(uart.types(), ["acme,uart", "ns16550a"]);
    assert_eq!(uart.str("status"), Some("okay"));
    assert_eq!(uart.property("reg").unwrap().ptype(), PropertyType::UInt32);
    assert_eq!(
        tree.node(intc).unwrap().property("interrupt-controller").unwrap().ptype(),
        PropertyType::Empty
    );
}

#[test]
fn edits_grow_a_packed_blob() {
    init();
    let backend = FdtBackend::from_bytes(&board()).unwrap().with_grow_step(64);
    let mut tree = Tree::new(Box::new(backend)).unwrap();

    let uart = tree.node_by_path("/soc/uart@1000").unwrap();
    tree.set_property(uart, "clock-frequency", vec![Value::Int(48_000_000)])
        .unwrap();
    tree.set_property(uart, "status", vec!["disabled".into()]).unwrap();
    assert!(tree.is_dirty());
    tree.sync().unwrap();
    assert!(!tree.is_dirty());

    assert!(tree.backend().to_dtb().unwrap().len() > board().len());
    let reopened = open(&tree.to_dtb().unwrap());
    let uart = reopened.node_by_path("/soc/uart@1000").unwrap();
    let uart = reopened.node(uart).unwrap();
    assert_eq!(uart.u32("clock-frequency"), Some(48_000_000));
    assert_eq!(uart.str("status"), Some("disabled"));
}

#[test]
fn capacity_bound() {
    init();
    let config = Config {
        max_capacity_retries: 1,
        ..Config::default()
    };
    let backend = FdtBackend::from_bytes(&board()).unwrap();
    let mut tree = Tree::with_config(Box::new(backend), config, Registries::default()).unwrap();
    let spare = tree.node_by_path("/spare").unwrap();
    tree.set_property(spare, "clock-frequency", vec![Value::Int(1)])
        .unwrap();

    let error = tree.sync().unwrap_err();
    assert!(
        matches!(
            error,
            Error::Capacity { operation: "set_property", attempts: 1, ref path } if path == "/spare"
        ),
        "{error}"
    );
}

#[test]
fn rename_is_applied_on_sync() {
    init();
    let mut tree = open(&board());
    let uart = tree.node_by_path("/soc/uart@1000").unwrap();
    let port = tree.node_by_path("/soc/uart@1000/port").unwrap();
    tree.rename_node(uart, "serial@1000").unwrap();
    assert_eq!(tree.node(port).unwrap().path(), "/soc/serial@1000/port");
    assert!(tree.node_by_path("/soc/uart@1000").is_none());

    // Not synced yet: the backend still has the old name, and resolving
    // keeps the pending rename.
    tree.resolve().unwrap();
    assert!(tree.backend().find("/soc/uart@1000").is_some());
    assert_eq!(tree.node(uart).unwrap().path(), "/soc/serial@1000");

    tree.sync().unwrap();
    assert!(tree.backend().find("/soc/uart@1000").is_none());
    assert!(tree.backend().find("/soc/serial@1000/port").is_some());
    assert_eq!(tree.node_by_path("/soc/serial@1000"), Some(uart));
    assert_eq!(tree.node(port).unwrap().state(), NodeState::Resolved);
}

#[test]
fn rename_rejects_siblings() {
    init();
    let mut tree = open(&board());
    let uart = tree.node_by_path("/soc/uart@1000").unwrap();
    assert!(matches!(
        tree.rename_node(uart, "intc@f000"),
        Err(Error::Backend { operation: "rename", .. })
    ));
    assert!(tree.rename_node(tree.root(), "x").is_err());
}

#[test]
fn add_copy_and_delete() {
    init();
    let mut tree = open(&board());
    let added = tree.add_node("/soc/bus@2000/timer").unwrap();
    assert_eq!(tree.node(added).unwrap().depth(), 3);
    assert!(tree.node_by_path("/soc/bus@2000").is_some());
    assert!(tree.add_node("/soc/bus@2000/timer").is_err());

    let uart = tree.node_by_path("/soc/uart@1000").unwrap();
    tree.set_property(uart, "current-speed", vec![Value::Int(115_200)])
        .unwrap();
    let root = tree.root();
    let copy = tree.copy_node(uart, root, Some("uart-copy")).unwrap();
    assert_eq!(tree.node(copy).unwrap().path(), "/uart-copy");
    let copy_node = tree.node(copy).unwrap();
    assert_eq!(copy_node.property("reg").unwrap().values(), [Value::Int(0x1000), Value::Int(0x100)]);
    assert_eq!(copy_node.u32("current-speed"), Some(115_200));
    assert!(tree.node_by_path("/uart-copy/port").is_some());

    let port = tree.node_by_path("/uart-copy/port").unwrap();
    tree.delete_node(copy).unwrap();
    assert!(tree.node_by_path("/uart-copy").is_none());
    assert_eq!(tree.node(copy).unwrap().state(), NodeState::Invalid);
    assert_eq!(tree.node(port).unwrap().state(), NodeState::Invalid);
    assert!(matches!(
        tree.set_property(copy, "status", vec!["okay".into()]),
        Err(Error::NodeNotFound(_))
    ));
    // The original keeps its unsynced edit.
    assert_eq!(tree.node(uart).unwrap().u32("current-speed"), Some(115_200));
}

#[test]
fn copies_get_fresh_phandles() {
    init();
    let source = r"
        / {
            intc: intc@f000 {
                #interrupt-cells = <1>;
                phandle = <1>;
                port { phandle = <2>; };
            };
            dev { interrupt-parent = <&intc>; };
        };
    ";
    let mut tree = Tree::new(Box::new(SourceBackend::parse(source).unwrap())).unwrap();
    let intc = tree.node_by_path("/intc@f000").unwrap();
    let root = tree.root();
    let copy = tree.copy_node(intc, root, Some("intc@e000")).unwrap();
    let port = tree.node_by_path("/intc@e000/port").unwrap();

    assert_eq!(tree.node(copy).unwrap().phandle(), 3);
    assert_eq!(tree.node(copy).unwrap().u32("phandle"), Some(3));
    assert_eq!(tree.node(port).unwrap().phandle(), 4);
    assert_eq!(tree.node_by_phandle(1), Some(intc));
    assert_eq!(tree.node_by_phandle(3), Some(copy));
    let mut phandles: Vec<u32> = tree.nodes().map(|node| node.phandle()).filter(|&p| p != 0).collect();
    phandles.sort_unstable();
    assert_eq!(phandles, [1, 2, 3, 4]);

    assert_eq!(tree.node(intc).unwrap().label(), Some("intc"));
    assert_eq!(tree.node(copy).unwrap().label(), None);
    assert_eq!(tree.node_by_label("intc"), Some(intc));
    let dev = tree.node_by_path("/dev").unwrap();
    assert_eq!(tree.references(dev).unwrap(), [intc]);
}

#[test]
fn delete_property() {
    init();
    let mut tree = open(&board());
    let spare = tree.node_by_path("/spare").unwrap();
    assert!(tree.delete_property(spare, "status").unwrap());
    assert!(!tree.delete_property(spare, "status").unwrap());
    assert!(tree.get_property(spare, "status").is_none());
    tree.resolve().unwrap();
    assert!(tree.get_property(spare, "status").is_none());

    tree.sync().unwrap();
    let id = tree.backend().find("/spare").unwrap();
    assert!(tree.backend().get_property(id, "status").is_none());
}

#[test]
fn snapshot_and_attach() {
    init();
    let mut backend = FdtBackend::from_bytes(&board()).unwrap();

    let mut snapshot = Tree::snapshot(&backend).unwrap();
    let spare = snapshot.node_by_path("/spare").unwrap();
    snapshot
        .set_property(spare, "status", vec!["okay".into()])
        .unwrap();
    snapshot.sync().unwrap();
    let id = backend.find("/spare").unwrap();
    assert_eq!(backend.get_property(id, "status").unwrap(), b"disabled\0");

    {
        let mut attached = Tree::attach(&mut backend).unwrap();
        let spare = attached.node_by_path("/spare").unwrap();
        attached
            .set_property(spare, "status", vec!["okay".into()])
            .unwrap();
        attached.sync().unwrap();
    }
    let id = backend.find("/spare").unwrap();
    assert_eq!(backend.get_property(id, "status").unwrap(), b"okay\0");
}

/// `/a` references `/b`, `/b` references `/d`; `/c` is not referenced.
fn referencing() -> Tree<'static> {
    let source = r"
        /dts-v1/;
        / {
            a {
                interrupt-parent = <&b>;
                child {
                    grandchild { };
                };
            };
            bus {
                b: b {
                    #clock-cells = <0>;
                    clocks = <&d>;
                };
            };
            c: c { };
            d: d {
                #clock-cells = <0>;
            };
        };
    ";
    Tree::new(Box::new(SourceBackend::parse(source).unwrap())).unwrap()
}

fn keys(tree: &Tree<'_>, paths: &[&str]) -> Vec<sdt::NodeKey> {
    paths
        .iter()
        .map(|path| tree.node_by_path(path).unwrap())
        .collect()
}

#[test]
fn ref_all_counts_references() {
    init();
    let mut tree = referencing();
    let a = tree.node_by_path("/a").unwrap();
    let counted = tree.ref_all(a, true).unwrap();

    let expected = keys(
        &tree,
        &["/", "/a", "/a/child", "/a/child/grandchild", "/bus", "/bus/b", "/d"],
    );
    assert_eq!(counted, expected.len());
    for &key in &expected {
        assert_eq!(tree.ref_count(key), 1, "{}", tree.node(key).unwrap().path());
    }
    let c = tree.node_by_path("/c").unwrap();
    assert_eq!(tree.ref_count(c), 0);
    assert_eq!(tree.referenced(None), expected);

    tree.ref_all(a, false).unwrap();
    assert_eq!(tree.ref_count(a), 2);
    assert_eq!(tree.ref_count(tree.root()), 1);

    tree.set_ref(0, Some(&Regex::new("^/a").unwrap()));
    assert_eq!(tree.ref_count(a), 0);
    assert_eq!(tree.ref_count(tree.root()), 1);
    tree.set_ref(0, None);
    assert!(tree.referenced(None).is_empty());
}

#[test]
fn masked_references() {
    init();
    let mut tree = referencing();
    let a = tree.node_by_path("/a").unwrap();
    let mask = [Regex::new("^clocks$").unwrap()];
    let reached = tree.resolve_all_refs(a, &mask, false).unwrap();
    assert_eq!(reached, keys(&tree, &["/a", "/bus/b"]));

    tree.ref_all_masked(a, false, &mask).unwrap();
    let d = tree.node_by_path("/d").unwrap();
    assert_eq!(tree.ref_count(d), 0);
}

#[test]
fn dangling_references() {
    init();
    let source = "/ { a { interrupt-parent = <0x99>; }; };";
    let tree = Tree::new(Box::new(SourceBackend::parse(source).unwrap())).unwrap();
    let a = tree.node_by_path("/a").unwrap();
    assert!(tree.references(a).unwrap().is_empty());
    let records = tree.reference_records(a, "interrupt-parent").unwrap().unwrap();
    assert!(records[0].dangling);

    let strict = Config {
        strict_phandles: true,
        ..Config::default()
    };
    let backend = SourceBackend::parse(source).unwrap();
    let tree = Tree::with_config(Box::new(backend), strict, Registries::default()).unwrap();
    let a = tree.node_by_path("/a").unwrap();
    let error = tree.references(a).unwrap_err();
    assert!(
        matches!(error, Error::InvalidReference { phandle: 0x99, ref property, .. } if property == "interrupt-parent"),
        "{error}"
    );
}

#[test]
fn phandle_allocation() {
    init();
    let mut tree = open(&board());
    assert_eq!(tree.next_phandle(), 2);
    let intc = tree.node_by_path("/soc/intc@f000").unwrap();
    assert_eq!(tree.ensure_phandle(intc).unwrap(), 1);

    let spare = tree.node_by_path("/spare").unwrap();
    assert_eq!(tree.ensure_phandle(spare).unwrap(), 2);
    assert_eq!(tree.node_by_phandle(2), Some(spare));
    assert_eq!(tree.next_phandle(), 3);

    tree.sync().unwrap();
    let id = tree.backend().find("/spare").unwrap();
    assert_eq!(tree.backend().id_to_cross_ref(id), Some(2));
}

#[test]
fn export_and_import() {
    init();
    let mut tree = open(&board());
    let json = tree.export().to_json().unwrap();
    let mut generic = GenericTree::from_json(&json).unwrap();
    assert_eq!(generic, tree.export());

    let spare = generic.get_mut("/spare").unwrap();
    spare.insert("status".to_owned(), "okay".into());
    spare.insert("dma-coherent".to_owned(), true.into());
    spare.insert(LABEL_KEY.to_owned(), "spare0".into());
    let uart = generic.get_mut("/soc/uart@1000").unwrap();
    uart.shift_remove("status");
    generic.remove("/soc/uart@1000/port");

    tree.import(&generic).unwrap();
    let spare = tree.node_by_path("/spare").unwrap();
    let spare_node = tree.node(spare).unwrap();
    assert_eq!(spare_node.str("status"), Some("okay"));
    assert_eq!(spare_node.property("dma-coherent").unwrap().ptype(), PropertyType::Empty);
    assert_eq!(tree.node_by_label("spare0"), Some(spare));
    let uart = tree.node_by_path("/soc/uart@1000").unwrap();
    assert!(tree.get_property(uart, "status").is_none());
    assert!(tree.node_by_path("/soc/uart@1000/port").is_none());

    let id = tree.backend().find("/spare").unwrap();
    assert_eq!(tree.backend().get_property(id, "dma-coherent").unwrap(), b"");
}

#[test]
fn open_detects_the_format() {
    init();
    let from_blob = Tree::from_bytes(&board(), Config::default(), Registries::default()).unwrap();
    assert_eq!(from_blob.backend().format(), "dtb");

    let source = b"/dts-v1/;\n/ { model = \"acme\"; };\n";
    let from_source = Tree::from_bytes(source, Config::default(), Registries::default()).unwrap();
    assert_eq!(from_source.backend().format(), "dts");
    let root = from_source.node(from_source.root()).unwrap();
    assert_eq!(root.str("model"), Some("acme"));

    assert!(Tree::from_bytes(b"\xd0\x0d\xfe\xed", Config::default(), Registries::default()).is_err());
}
