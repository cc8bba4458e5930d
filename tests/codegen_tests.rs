use ipu_codelet::codegen::{artifact_fingerprint, compute_symbol, run_codelet_symbol};
use ipu_codelet::{
    define_codelet, generate, parse_codelet, parse_codelets, Codelet, CodegenOptions, CodeletError, TargetDesc,
};

const SCALE: &str = "\
const FACTOR: f32 = 2.5
const LUT: [u32] = [1, 2, 4, 8]

fn twice(v) {
    return v + v
}

codelet Scale(x: in [f32], y: out [f32], n: in u32, total: out u32) {
    @cycles \"scale\" {
        for i in 0 .. len(x) {
            y[i] = twice(x[i]) * FACTOR + sqrt(x[i])
        }
    }
    total = twice(n) + LUT[n % 4]
    @println(\"scaled \", len(x), \" values\")
}
";

fn scale() -> Codelet {
    define_codelet(parse_codelet(SCALE).unwrap()).unwrap()
}

fn with_print(print: bool) -> CodegenOptions {
    CodegenOptions { print }
}

#[test]
fn module_layout() {
    let artifact = generate(&scale(), &TargetDesc::ipu21(), &CodegenOptions::default()).unwrap();
    let module = &artifact.module;

    assert!(module.starts_with("; ModuleID = 'Scale'\n"));
    assert!(module.contains("target triple = \"colossus-graphcore-unknown-elf\""));
    assert!(module.contains("%Scale.state = type { { ptr, i32 }, { ptr, i32 }, ptr, ptr }"));
    assert!(module.contains("@Scale.LUT = private unnamed_addr constant [4 x i32] [i32 1, i32 2, i32 4, i32 8]"));
    assert!(module.contains("define zeroext i1 @_ZN5Scale7computeEv(ptr noundef %this) nounwind"));

    let state = module.find("%Scale.state = type").unwrap();
    let table = module.find("@Scale.LUT =").unwrap();
    let compute = module.find("define zeroext i1").unwrap();
    assert!(state < table && table < compute);

    assert_eq!(artifact.symbol, compute_symbol("Scale"));
    assert_eq!(artifact.entry_symbol(), run_codelet_symbol("Scale"));
    assert_eq!(artifact.entry_symbol(), "__runCodelet_Scale");
    assert_eq!(artifact.symbols.last(), Some(&artifact.symbol));
    assert_eq!(artifact.target, "ipu21");
}

#[test]
fn generic_helpers_are_specialised_per_type() {
    let artifact = generate(&scale(), &TargetDesc::ipu2(), &CodegenOptions::default()).unwrap();
    let module = &artifact.module;

    assert!(module.contains("define internal float @Scale.twice.f32(float %arg0) nounwind"));
    assert!(module.contains("define internal i32 @Scale.twice.u32(i32 %arg0) nounwind"));
    assert_eq!(module.matches("@Scale.twice.f32(float %arg0) nounwind").count(), 1);
    assert!(artifact.symbols.contains(&"Scale.twice.f32".to_string()));
    assert!(artifact.symbols.contains(&"Scale.twice.u32".to_string()));
}

#[test]
fn generation_is_deterministic() {
    let target = TargetDesc::ipu2();
    let first = generate(&scale(), &target, &CodegenOptions::default()).unwrap();
    let second = generate(&scale(), &target, &CodegenOptions::default()).unwrap();
    assert_eq!(first.module, second.module);
    assert_eq!(first.vertex_declaration, second.vertex_declaration);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first, second);
}

#[test]
fn print_instrumentation_follows_options() {
    let target = TargetDesc::ipu2();
    let on = generate(&scale(), &target, &with_print(true)).unwrap();
    let off = generate(&scale(), &target, &with_print(false)).unwrap();

    assert!(on.module.contains("declare i32 @printf(ptr, ...)"));
    assert!(on.module.contains("@llvm.colossus.get.scount.l()"));
    assert!(on.module.contains("c\"scale: %u cycles\\0A\\00\""));

    assert!(!off.module.contains("@printf"));
    assert!(!off.module.contains("get.scount.l"));
    assert!(!off.module.contains("@.str."));
    // The measured body is still there.
    assert!(off.module.contains("@Scale.twice.f32"));

    assert_ne!(on.fingerprint, off.fingerprint);
}

#[test]
fn fingerprints_track_codelet_target_and_options() {
    let codelet = scale();
    let options = CodegenOptions::default();
    let ipu2 = artifact_fingerprint(&codelet, &TargetDesc::ipu2(), &options);
    let ipu21 = artifact_fingerprint(&codelet, &TargetDesc::ipu21(), &options);
    assert_ne!(ipu2, ipu21);

    let reparsed = define_codelet(parse_codelet(SCALE).unwrap()).unwrap();
    assert_eq!(reparsed.fingerprint(), codelet.fingerprint());
    assert_eq!(artifact_fingerprint(&reparsed, &TargetDesc::ipu2(), &options), ipu2);

    let edited = define_codelet(parse_codelet(&SCALE.replace("2.5", "3.5")).unwrap()).unwrap();
    assert_ne!(edited.fingerprint(), codelet.fingerprint());
}

#[test]
fn vertex_declaration_lists_fields() {
    let artifact = generate(&scale(), &TargetDesc::ipu2(), &CodegenOptions::default()).unwrap();
    let decl = &artifact.vertex_declaration;
    assert!(decl.contains("class Scale : public poplar::Vertex {"));
    assert!(decl.contains("  poplar::Input<poplar::Vector<float>> x;"));
    assert!(decl.contains("  poplar::Output<poplar::Vector<float>> y;"));
    assert!(decl.contains("  poplar::Input<unsigned int> n;"));
    assert!(decl.contains("  poplar::Output<unsigned int> total;"));
    assert!(decl.contains("  bool compute();"));

    let slots: Vec<(&str, u32)> = artifact.fields.iter().map(|f| (f.name.as_str(), f.slot)).collect();
    assert_eq!(slots, [("x", 0), ("y", 1), ("n", 2), ("total", 3)]);
}

#[test]
fn recursion_is_a_lowering_error() {
    let codelet = define_codelet(
        parse_codelet(
            "fn spin(v) {\n return spin(v)\n}\n\
             codelet Spin(y: out [f32]) {\n y[0] = spin(1.0)\n}\n",
        )
        .unwrap(),
    )
    .unwrap();

    let err = generate(&codelet, &TargetDesc::ipu2(), &CodegenOptions::default()).unwrap_err();
    assert_eq!(err.codelet, "Spin");
    assert!(err.reason.contains("recursion"), "{}", err);
    let err = CodeletError::from(err);
    assert!(err.to_string().contains("cannot lower"));
}

#[test]
fn each_codelet_of_a_file_is_independent() {
    let specs = parse_codelets(
        "const K: u32 = 3\n\
         codelet Fill(y: out [u32]) {\n for i in 0 .. len(y) {\n y[i] = K\n }\n}\n\
         codelet Noise(y: out [f32]) {\n for i in 0 .. len(y) {\n y[i] = rand(f32)\n }\n}\n",
    )
    .unwrap();
    let codelets: Vec<Codelet> = specs.into_iter().map(|s| define_codelet(s).unwrap()).collect();
    assert_eq!(codelets.len(), 2);

    let fill = generate(&codelets[0], &TargetDesc::ipu2(), &CodegenOptions::default()).unwrap();
    let noise = generate(&codelets[1], &TargetDesc::ipu2(), &CodegenOptions::default()).unwrap();
    assert!(!fill.module.contains("urand32"));
    assert!(noise.module.contains("declare i32 @llvm.colossus.urand32()"));
    assert!(noise.module.contains("_ZN5Noise7computeEv"));
}

#[test]
fn helper_names_never_clash_with_declarations() {
    let codelet = define_codelet(
        parse_codelet(
            "fn printf() {\n}\n\
             codelet Shout(y: out [u32]) {\n printf()\n @println(\"hi\")\n y[0] = 1\n}\n",
        )
        .unwrap(),
    )
    .unwrap();

    let artifact = generate(&codelet, &TargetDesc::ipu2(), &CodegenOptions::default()).unwrap();
    let module = &artifact.module;
    assert!(module.contains("define internal void @Shout.printf() nounwind"));
    assert!(module.contains("declare i32 @printf(ptr, ...)"));
    assert_eq!(module.matches("@printf(").count(), 2, "{}", module);
}
