// Copyright 2024 Google LLC.
// This project is dual-licensed under Apache 2.0 and MIT terms.
// See LICENSE-APACHE and LICENSE-MIT for details.

use sdt::backend::{Backend, FdtBackend, SourceBackend};
use sdt::codec::{self, PropertyType, Value};
use sdt::phandle::{NoContext, PhandleRegistry, positions};
use sdt::schema::{SchemaResolver, SchemaScanner};
use sdt::printer::Printer;
use sdt::{Config, Registries, Tree};
use sdt_device_tree::model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const BOARD: &str = r#"
/dts-v1/;
/ {
    dma: dma-controller@0 {
        #dma-cells = <1>;
    };
    sensor@1 {
        compatible = "acme,sensor";
        acme,rate = /bits/ 64 <0x100000002>;
        acme,dmas = <&dma 1>, <&dma 2>;
        label = "left";
    };
    sensor@2 {
        compatible = "acme,sensor";
        label = "right";
    };
    panel {
        compatible = "acme,panel";
        label = <7>;
    };
};
"#;

/// The same board as a blob, with the shape information lost.
fn board() -> Vec<u8> {
    DeviceTree::new(
        DeviceTreeNode::builder("")
            .child(
                DeviceTreeNode::builder("dma-controller@0")
                    .cells("#dma-cells", &[1])
                    .cells("phandle", &[1])
                    .build(),
            )
            .child(
                DeviceTreeNode::builder("sensor@1")
                    .strings("compatible", &["acme,sensor"])
                    .property(DeviceTreeProperty::new(
                        "acme,rate",
                        0x1_0000_0002u64.to_be_bytes().to_vec(),
                    ))
                    .cells("acme,dmas", &[1, 1, 1, 2])
                    .strings("label", &["left"])
                    .build(),
            )
            .child(
                DeviceTreeNode::builder("panel")
                    .strings("compatible", &["acme,panel"])
                    .cells("label", &[7])
                    .build(),
            )
            .build(),
    )
    .to_dtb()
}

#[test]
fn guessing_types() {
    assert_eq!(codec::guess_type(b""), PropertyType::Empty);
    assert_eq!(codec::guess_type(b"okay\0"), PropertyType::String);
    assert_eq!(codec::guess_type(b"acme,uart\0ns16550a\0"), PropertyType::MultiString);
    assert_eq!(codec::guess_type(&[0, 0, 0x10, 0]), PropertyType::UInt32);
    assert_eq!(codec::guess_type(&[2, 0, 0, 0, 0, 1]), PropertyType::UInt8);
    assert_eq!(codec::guess_type(b"\0\0\0\0"), PropertyType::UInt32);
    // Unterminated text is not a string.
    assert_eq!(codec::guess_type(b"abc"), PropertyType::UInt8);
    assert_eq!(codec::guess_type_named("status", b"okay\0"), PropertyType::String);
}

#[test]
fn eight_bytes_are_two_cells_unless_told_otherwise() {
    let bytes = 0x1_0000_0002u64.to_be_bytes();
    assert_eq!(codec::guess_type(&bytes), PropertyType::UInt32);
    assert_eq!(
        codec::decode(&bytes, PropertyType::Unknown),
        [Value::Int(1), Value::Int(2)]
    );
    assert_eq!(
        codec::decode(&bytes, PropertyType::UInt64),
        [Value::Int(0x1_0000_0002)]
    );
}

#[test]
fn mask_records() {
    let registry = PhandleRegistry::with_defaults();
    let values: Vec<Value> = [1u32, 0xf, 0, 2, 0x3, 1].into_iter().map(Value::from).collect();
    assert_eq!(registry.phandle_positions("cpus", &values, &NoContext), [0, 3]);
    assert_eq!(positions(1, 3, values.len()), [0, 3]);
    assert!(registry.phandle_positions("reg", &values, &NoContext).is_empty());
}

#[test]
fn scanning_learns_types_and_shapes() {
    init();
    let mut scanner = SchemaScanner::new();
    scanner.scan(BOARD);

    let shape = scanner.shape("acme,dmas").unwrap();
    assert!(shape.repeat);
    let specs: Vec<(&str, String)> = scanner.phandle_specs().collect();
    assert_eq!(specs, [("acme,dmas", "phandle field".to_owned())]);
    assert!(scanner.labels().any(|(label, path)| label == "dma" && path == "/dma-controller@0"));

    let schema = scanner.schema();
    assert_eq!(schema.global_type("acme,rate"), Some(PropertyType::UInt64));
    // Written as a string twice and as cells once.
    assert_eq!(schema.global_type("label"), Some(PropertyType::String));
    assert_eq!(
        schema.resolve("label", Some("/panel"), &["acme,panel".to_owned()]),
        PropertyType::UInt32
    );
    assert_eq!(
        schema.resolve("label", Some("/elsewhere"), &["acme,sensor".to_owned()]),
        PropertyType::String
    );
}

#[test]
fn learned_rules_type_a_blob() {
    init();
    let plain = Tree::new(Box::new(FdtBackend::from_bytes(&board()).unwrap())).unwrap();
    let sensor = plain.node_by_path("/sensor@1").unwrap();
    assert_eq!(
        plain.get_property(sensor, "acme,rate").unwrap(),
        [Value::Int(1), Value::Int(2)]
    );
    assert!(plain.references(sensor).unwrap().is_empty());

    let mut scanner = SchemaScanner::new();
    scanner.scan(BOARD);
    let mut registries = Registries::default();
    registries.learn(&scanner);
    let backend = FdtBackend::from_bytes(&board()).unwrap();
    let tree = Tree::with_config(Box::new(backend), Config::default(), registries).unwrap();

    let sensor = tree.node_by_path("/sensor@1").unwrap();
    let rate = tree.node(sensor).unwrap().property("acme,rate").unwrap();
    assert_eq!(rate.ptype(), PropertyType::UInt64);
    assert_eq!(rate.values(), [Value::Int(0x1_0000_0002)]);

    let dma = tree.node_by_path("/dma-controller@0").unwrap();
    assert_eq!(tree.references(sensor).unwrap(), [dma]);
    let records = tree.reference_records(sensor, "acme,dmas").unwrap().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].targets, [(2, Some(dma))]);

    let panel = tree.node_by_path("/panel").unwrap();
    assert_eq!(tree.node(panel).unwrap().u32("label"), Some(7));
    assert_eq!(tree.node(sensor).unwrap().str("label"), Some("left"));
}

#[test]
fn retype_applies_new_rules() {
    init();
    let mut tree = Tree::new(Box::new(FdtBackend::from_bytes(&board()).unwrap())).unwrap();
    let sensor = tree.node_by_path("/sensor@1").unwrap();

    let mut schema = SchemaResolver::new();
    schema.set_compatible_type("acme,sensor", "acme,rate", PropertyType::UInt64);
    tree.registries_mut().schema.merge(&schema);
    tree.retype();
    assert_eq!(
        tree.get_property(sensor, "acme,rate").unwrap(),
        [Value::Int(0x1_0000_0002)]
    );
    assert!(!tree.is_dirty());
}

#[test]
fn vendor_cells_stay_numbers() {
    init();
    let source = r#"/ { dev { xlnx,id = <0x0>; xlnx,base = <0x1>; xlnx,name = "zynq"; }; };"#;
    let backend = SourceBackend::parse(source).unwrap();
    let blob = backend.to_dtb().unwrap();

    for tree in [
        Tree::new(Box::new(backend)).unwrap(),
        Tree::new(Box::new(FdtBackend::from_bytes(&blob).unwrap())).unwrap(),
    ] {
        let dev = tree.node(tree.node_by_path("/dev").unwrap()).unwrap();
        let id = dev.property("xlnx,id").unwrap();
        assert_eq!(id.ptype(), PropertyType::UInt32);
        assert_eq!(id.values(), [Value::Int(0)]);
        assert_eq!(dev.u32("xlnx,base"), Some(1));
        assert_eq!(dev.str("xlnx,name"), Some("zynq"));

        let text = Printer::new().print(&tree).unwrap();
        assert!(text.contains("xlnx,id = <0x0>;"), "{text}");
        assert!(text.contains("xlnx,base = <0x1>;"), "{text}");
        assert!(text.contains("xlnx,name = \"zynq\";"), "{text}");
    }
}
