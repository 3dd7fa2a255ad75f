// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use sdt::annotate::annotate;
use sdt::backend::{Backend, FdtBackend, SourceBackend};
use sdt::codec::Value;
use sdt::printer::Printer;
use sdt::{Config, Error, Tree};
use sdt_device_tree::MemoryReservation;
use sdt_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn parse(source: &str) -> Tree<'static> {
    Tree::new(Box::new(SourceBackend::parse(source).unwrap())).unwrap()
}

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

fn board() -> Vec<u8> {
    DeviceTree::new(
        DeviceTreeNode::builder("")
            .strings("compatible", &["acme,board"])
            .child(
                DeviceTreeNode::builder("intc@f000")
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
                    .property(DeviceTreeProperty::new("local-mac-address", vec![2u8, 0, 0, 0, 0, 1]))
                    .build(),
            )
            .build(),
    )
    .to_dtb()
}

#[test]
fn printed_source_parses_back() {
    init();
    let tree = Tree::new(Box::new(FdtBackend::from_bytes(&board()).unwrap())).unwrap();
    let text = Printer::new().print(&tree).unwrap();
    assert!(text.contains("intcf000: intc@f000 {"), "{text}");
    assert!(text.contains("interrupt-parent = <&intcf000>;"), "{text}");
    assert!(text.contains("compatible = \"acme,uart\", \"ns16550a\";"), "{text}");
    assert!(text.contains("interrupt-controller;"), "{text}");

    let reparsed = parse(&text);
    assert_eq!(listing(&reparsed), listing(&tree));
    let intc = reparsed.node_by_path("/intc@f000").unwrap();
    assert_eq!(reparsed.node_by_label("intcf000"), Some(intc));
}

#[test]
fn indent_is_configurable() {
    init();
    let tree = parse("/ { a { b { x = <1>; }; }; };");
    let text = Printer::new().with_indent(2).print(&tree).unwrap();
    assert!(text.contains("/ {\n\n  a {\n\n    b {\n      x = <0x1>;\n    };\n  };\n};\n"), "{text}");
}

#[test]
fn memory_reservations_survive() {
    init();
    let mut backend = SourceBackend::parse("/ { };").unwrap();
    backend.reserve(MemoryReservation::new(0x8000_0000, 0x10_0000));
    let tree = Tree::new(Box::new(backend)).unwrap();
    let text = Printer::new().print(&tree).unwrap();
    assert!(text.contains("/memreserve/ 0x80000000 0x100000;\n"), "{text}");

    let reparsed = parse(&text);
    assert_eq!(
        reparsed.memory_reservations(),
        [MemoryReservation::new(0x8000_0000, 0x10_0000)]
    );
    let blob = Tree::new(Box::new(FdtBackend::from_bytes(&reparsed.to_dtb().unwrap()).unwrap()))
        .unwrap();
    assert_eq!(blob.memory_reservations(), reparsed.memory_reservations());
}

#[test]
fn sibling_labels_must_differ() {
    init();
    let mut tree = parse("/ { bus { foo: a { }; b { }; }; };");
    let b = tree.node_by_path("/bus/b").unwrap();
    tree.set_label(b, Some("foo")).unwrap();
    let error = Printer::new().print(&tree).unwrap_err();
    assert!(
        matches!(error, Error::DuplicateLabel { ref label, ref first, ref second }
            if label == "foo" && first == "/bus/a" && second == "/bus/b"),
        "{error}"
    );

    tree.set_label(b, Some("bar")).unwrap();
    let text = Printer::new().print(&tree).unwrap();
    assert!(text.contains("foo: a {") && text.contains("bar: b {"), "{text}");
}

#[test]
fn strict_references_fail_to_print() {
    init();
    let source = "/ { dev { interrupt-parent = <5>; }; };";
    let strict = Config {
        strict_phandles: true,
        ..Config::default()
    };
    let backend = SourceBackend::parse(source).unwrap();
    let tree = Tree::with_config(Box::new(backend), strict, sdt::Registries::default()).unwrap();
    assert!(matches!(
        Printer::new().print(&tree),
        Err(Error::InvalidReference { phandle: 5, .. })
    ));
}

#[test]
fn comments_and_labels_survive_a_blob() {
    init();
    let source = "\
/* Board description */
/dts-v1/;

/ {
\t// console
\tuart0: serial@1000 {
\t\tcompatible = \"ns16550a\";
\t};

\tleds {
\t\tinterrupt-parent = <&uart0>;
\t};
};
";
    let annotated = annotate(source, &Config::default()).unwrap();
    assert_eq!(annotated.lines().count(), source.lines().count());

    let blob = SourceBackend::parse(&annotated).unwrap().to_dtb().unwrap();
    let tree = Tree::new(Box::new(FdtBackend::from_bytes(&blob).unwrap())).unwrap();
    let serial = tree.node_by_path("/serial@1000").unwrap();
    assert_eq!(tree.node(serial).unwrap().label(), Some("uart0"));
    assert_eq!(tree.node_by_label("uart0"), Some(serial));

    let text = Printer::new().print(&tree).unwrap();
    assert!(text.starts_with("/* Board description */\n/dts-v1/;\n"), "{text}");
    assert!(text.contains("        // console\n"), "{text}");
    assert!(text.contains("uart0: serial@1000 {"), "{text}");
    assert!(text.contains("interrupt-parent = <&uart0>;"), "{text}");
    assert!(!text.contains("sdt-"), "{text}");
}

#[test]
fn cells_after_the_last_whole_record_print_as_numbers() {
    init();
    let tree = parse(
        "/ {
            clk: clock { #clock-cells = <2>; };
            dev { clocks = <&clk 7 8>, <&clk 7>; };
        };",
    );
    let dev = tree.node_by_path("/dev").unwrap();
    assert_eq!(tree.reference_records(dev, "clocks").unwrap().unwrap().len(), 1);

    let text = Printer::new().print(&tree).unwrap();
    assert!(text.contains("clocks = <&clk 0x7 0x8>,"), "{text}");
    assert!(text.contains("<0x1 0x7>;"), "{text}");
    assert_eq!(listing(&parse(&text)), listing(&tree));
}
