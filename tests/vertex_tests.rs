use std::sync::Arc;

use ipu_codelet::graph::Allocation;
use ipu_codelet::{
    add_vertex, add_vertex_across_tiles, define_codelet, generate, parse_codelet, BindingMismatchError,
    CodegenOptions, CompiledArtifact, Direction, ElemType, Graph, IpuModel, TargetDesc, Tensor, VertexVector,
};

const TILES: u32 = 4;

fn artifact() -> Arc<CompiledArtifact> {
    let codelet = define_codelet(
        parse_codelet(
            "codelet Axpy(x: in [f32], y: inout [f32], a: in f32) {\n\
                 for i in 0 .. len(x) {\n\
                     y[i] = y[i] + a * x[i]\n\
                 }\n\
             }",
        )
        .unwrap(),
    )
    .unwrap();
    Arc::new(generate(&codelet, &TargetDesc::model(TILES), &CodegenOptions::default()).unwrap())
}

struct Setup {
    graph: Graph,
    x: Tensor,
    y: Tensor,
    a: Tensor,
}

fn setup() -> Setup {
    let mut graph = Graph::new(&IpuModel::new(TILES));
    let x = graph.add_variable("x", ElemType::F32, 16);
    let y = graph.add_variable("y", ElemType::F32, 16);
    let a = graph.add_variable("a", ElemType::F32, 1);
    Setup { graph, x, y, a }
}

fn bindings(x: Allocation, y: Allocation, a: Allocation) -> [(&'static str, VertexVector); 3] {
    [
        ("x", VertexVector::input(x)),
        ("y", VertexVector::in_out(y)),
        ("a", VertexVector::input(a)),
    ]
}

fn with_extra<'a>(
    bindings: &[(&'a str, VertexVector)],
    extra: (&'a str, VertexVector),
) -> Vec<(&'a str, VertexVector)> {
    let mut all = bindings.to_vec();
    all.push(extra);
    all
}

#[test]
fn registers_codelet_and_vertex() {
    let artifact = artifact();
    let Setup { mut graph, x, y, a } = setup();

    let id = add_vertex(&mut graph, &artifact, 2, &bindings(x.all(), y.all(), a.all())).unwrap();
    let vertex = graph.vertex(id).unwrap();
    assert_eq!(vertex.codelet, "Axpy");
    assert_eq!(vertex.tile, 2);
    assert_eq!(vertex.binding("y").unwrap().direction, Direction::InOut);

    let registered = graph.codelet("Axpy").unwrap();
    assert_eq!(registered.fields.len(), 3);
    assert!(registered.artifact.is_some());

    // Later vertices may name the codelet by symbol.
    add_vertex(&mut graph, "Axpy", 3, &bindings(x.all(), y.all(), a.all())).unwrap();
    assert_eq!(graph.vertices().len(), 2);
    assert_eq!(graph.vertices_on(3).count(), 1);
}

#[test]
fn bindings_may_come_in_any_order() {
    let artifact = artifact();
    let Setup { mut graph, x, y, a } = setup();
    let mut reversed = bindings(x.all(), y.all(), a.all());
    reversed.reverse();

    let id = add_vertex(&mut graph, &artifact, 0, &reversed).unwrap();
    let names: Vec<&str> = graph.vertex(id).unwrap().bindings.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["x", "y", "a"]);
}

#[test]
fn mismatches_are_rejected_without_side_effects() {
    let artifact = artifact();
    let Setup { mut graph, x, y, a } = setup();
    let ints = graph.add_variable("ints", ElemType::U32, 16);
    let good = bindings(x.all(), y.all(), a.all());

    let cases: Vec<(Vec<(&str, VertexVector)>, u32)> = vec![
        // tile out of range
        (good.to_vec(), TILES),
        // missing field
        (good[..2].to_vec(), 0),
        // unexpected field
        (with_extra(&good, ("z", VertexVector::input(x.all()))), 0),
        // duplicate field
        (with_extra(&good, ("x", VertexVector::input(x.all()))), 0),
        // direction
        (vec![("x", VertexVector::output(x.all())), good[1], good[2]], 0),
        // element type
        (vec![("x", VertexVector::input(ints.all())), good[1], good[2]], 0),
        // scalar bound to several elements
        (vec![good[0], good[1], ("a", VertexVector::input(x.slice(0..2)))], 0),
        // slice past the end
        (vec![("x", VertexVector::input(x.slice(8..20))), good[1], good[2]], 0),
    ];

    let mut errors = Vec::new();
    for (bindings, tile) in &cases {
        errors.push(add_vertex(&mut graph, &artifact, *tile, bindings).unwrap_err());
    }

    assert!(matches!(errors[0], BindingMismatchError::TileOutOfRange { tile: 4, num_tiles: 4 }));
    assert!(matches!(&errors[1], BindingMismatchError::MissingField { field, .. } if field == "a"));
    assert!(matches!(&errors[2], BindingMismatchError::UnexpectedField { field, .. } if field == "z"));
    assert!(matches!(&errors[3], BindingMismatchError::DuplicateField { field } if field == "x"));
    assert!(matches!(
        errors[4],
        BindingMismatchError::DirectionMismatch {
            expected: Direction::Input,
            found: Direction::Output,
            ..
        }
    ));
    assert!(matches!(
        errors[5],
        BindingMismatchError::TypeMismatch {
            expected: ElemType::F32,
            found: ElemType::U32,
            ..
        }
    ));
    assert!(matches!(errors[6], BindingMismatchError::ShapeMismatch { len: 2, .. }));
    assert!(matches!(errors[7], BindingMismatchError::SliceOutOfRange { end: 20, len: 16, .. }));

    assert!(graph.vertices().is_empty());
    assert!(graph.codelet("Axpy").is_none());
}

#[test]
fn unknown_symbol() {
    let Setup { mut graph, x, y, a } = setup();
    let err = add_vertex(&mut graph, "Missing", 0, &bindings(x.all(), y.all(), a.all())).unwrap_err();
    assert_eq!(err, BindingMismatchError::UnknownCodelet { symbol: "Missing".into() });
}

#[test]
fn tile_mapping_must_match() {
    let artifact = artifact();
    let Setup { mut graph, x, y, a } = setup();
    graph.set_tile_mapping(&x, 1).unwrap();

    let err = add_vertex(&mut graph, &artifact, 0, &bindings(x.all(), y.all(), a.all())).unwrap_err();
    assert_eq!(
        err,
        BindingMismatchError::TileMismatch {
            field: "x".into(),
            mapped: 1,
            tile: 0
        }
    );
    add_vertex(&mut graph, &artifact, 1, &bindings(x.all(), y.all(), a.all())).unwrap();
}

#[test]
fn spreads_work_across_tiles() {
    let artifact = artifact();
    let Setup { mut graph, x, y, a } = setup();

    let ids = add_vertex_across_tiles(&mut graph, &artifact, &[0, 1, 2, 3], &bindings(x.all(), y.all(), a.all()))
        .unwrap();
    assert_eq!(ids.len(), 4);
    for (tile, id) in (0u32..).zip(&ids) {
        let vertex = graph.vertex(*id).unwrap();
        assert_eq!(vertex.tile, tile);
        let x_chunk = vertex.binding("x").unwrap().allocation;
        assert_eq!((x_chunk.offset, x_chunk.len), (tile * 4, 4));
        // The scalar is shared by every vertex.
        assert_eq!(vertex.binding("a").unwrap().allocation, a.all());
    }
    let info = graph.tensor(x.id()).unwrap();
    assert_eq!(info.tiles_of(0, 16), [0, 1, 2, 3]);
}

#[test]
fn spreading_is_all_or_nothing() {
    let artifact = artifact();
    let Setup { mut graph, x, y, a } = setup();

    let err = add_vertex_across_tiles(&mut graph, &artifact, &[0, 1, 2], &bindings(x.all(), y.all(), a.all()))
        .unwrap_err();
    assert!(matches!(err, BindingMismatchError::UnevenSplit { len: 16, tiles: 3, .. }));

    // The last tile is out of range: nothing may be left behind.
    let err = add_vertex_across_tiles(&mut graph, &artifact, &[0, 1, 2, 7], &bindings(x.all(), y.all(), a.all()))
        .unwrap_err();
    assert!(matches!(err, BindingMismatchError::TileOutOfRange { tile: 7, .. }));
    assert!(graph.vertices().is_empty());
    assert!(graph.tensor(x.id()).unwrap().mapping.is_empty());
    assert!(graph.codelet("Axpy").is_none());
}

fn artifact_of(source: &str, options: &CodegenOptions) -> Arc<CompiledArtifact> {
    let codelet = define_codelet(parse_codelet(source).unwrap()).unwrap();
    Arc::new(generate(&codelet, &TargetDesc::model(TILES), options).unwrap())
}

#[test]
fn same_name_different_codelet_is_rejected() {
    let floats = artifact_of("codelet K(x: in [f32]) {\n @println(\"f\")\n}", &CodegenOptions::default());
    let ints = artifact_of("codelet K(x: in [u32]) {\n @println(\"u\")\n}", &CodegenOptions::default());
    let mut graph = Graph::new(&IpuModel::new(TILES));
    let xf = graph.add_variable("xf", ElemType::F32, 4);
    let xu = graph.add_variable("xu", ElemType::U32, 4);

    add_vertex(&mut graph, &floats, 0, &[("x", VertexVector::input(xf.all()))]).unwrap();

    // Checked against its own signature, then refused because `K` is taken.
    for x in [xu.all(), xf.all()] {
        let err = add_vertex(&mut graph, &ints, 1, &[("x", VertexVector::input(x))]).unwrap_err();
        assert_eq!(err, BindingMismatchError::ConflictingCodelet { symbol: "K".into() });
    }
    let err = add_vertex_across_tiles(&mut graph, &ints, &[1, 2], &[("x", VertexVector::input(xu.all()))])
        .unwrap_err();
    assert_eq!(err, BindingMismatchError::ConflictingCodelet { symbol: "K".into() });

    assert_eq!(graph.vertices().len(), 1);
    let registered = graph.codelet("K").unwrap();
    assert_eq!(registered.fields[0].elem, ElemType::F32);
    assert_eq!(registered.artifact.as_ref().unwrap().fingerprint, floats.fingerprint);
}

#[test]
fn print_variants_of_one_codelet_conflict() {
    let source = "codelet K(x: in [f32]) {\n @println(\"hi\")\n}";
    let on = artifact_of(source, &CodegenOptions { print: true });
    let off = artifact_of(source, &CodegenOptions { print: false });
    let mut graph = Graph::new(&IpuModel::new(TILES));
    let x = graph.add_variable("x", ElemType::F32, 4);

    add_vertex(&mut graph, &on, 0, &[("x", VertexVector::input(x.all()))]).unwrap();
    // The very same artifact may be reused.
    add_vertex(&mut graph, &on, 0, &[("x", VertexVector::input(x.all()))]).unwrap();
    let err = add_vertex(&mut graph, &off, 0, &[("x", VertexVector::input(x.all()))]).unwrap_err();
    assert_eq!(err, BindingMismatchError::ConflictingCodelet { symbol: "K".into() });
    assert_eq!(graph.vertices().len(), 2);
}

#[test]
fn last_element_index_is_out_of_range() {
    let artifact = artifact();
    let Setup { mut graph, x, y, a } = setup();
    let err = add_vertex(&mut graph, &artifact, 0, &bindings(x.all(), y.all(), a.element(u32::MAX))).unwrap_err();
    assert!(matches!(
        err,
        BindingMismatchError::SliceOutOfRange {
            offset: u32::MAX,
            end: u32::MAX,
            len: 1,
            ..
        }
    ));
    assert!(graph.vertices().is_empty());
}
