use ipu_codelet::core::Rule;
use ipu_codelet::intrinsics;
use ipu_codelet::kernel::{Callee, Expr, Stmt};
use ipu_codelet::{define_codelet, parse_codelet, verify, ElemType, KernelSpec, VerificationError};

fn reject(source: &str) -> VerificationError {
    define_codelet(parse_codelet(source).unwrap()).unwrap_err()
}

#[test]
fn accepts_device_subset() {
    let codelet = define_codelet(
        parse_codelet(
            "const LUT: [f32] = [0.5, 0.25]\n\
             fn clamp01(v: f32) {\n if v < 0.0 {\n return 0.0\n }\n return select(v > 1.0, 1.0, v)\n}\n\
             codelet Mix(x: in [f32], y: out [f32]) {\n\
                 for i in 0 .. len(x) {\n\
                     y[i] = clamp01(sqrt(x[i]) * LUT[i % 2] + rand(f32))\n\
                 }\n\
                 @show(tile_id())\n\
             }\n",
        )
        .unwrap(),
    );
    assert!(codelet.is_ok(), "{:?}", codelet.err());
}

#[test]
fn heap_allocation() {
    let err = reject("codelet K(y: out [f32]) {\n let buf = new [f32; 64]\n y[0] = 1.0\n}");
    assert_eq!(err.rule(), Rule::HeapAllocation);
    assert_eq!(err.violations()[0].location, "compute/0");
    assert!(err.to_string().contains("heap-allocation"));
}

#[test]
fn dynamic_dispatch() {
    let err = reject("codelet K(x: in [f32], y: out [f32]) {\n y[0] = x.sum()\n}");
    assert_eq!(err.rule(), Rule::DynamicDispatch);
    assert!(err.violations()[0].detail.contains(".sum()"));
}

#[test]
fn foreign_and_runtime_calls() {
    let err = reject(
        "codelet K(x: in [f32], y: out [f32]) {\n\
             y[0] = libm::sinh(x[0])\n\
             y[1] = runtime::gc_alloc(4)\n\
             y[2] = erf(x[0])\n\
         }",
    );
    let rules: Vec<Rule> = err.violations().iter().map(|v| v.rule).collect();
    assert_eq!(rules, [Rule::ForeignCall, Rule::ForeignCall, Rule::ForeignCall]);
    assert!(err.violations()[0].detail.contains("libm"));
    assert!(err.violations()[2].detail.contains("erf/1"));
}

#[test]
fn host_data_must_be_captured_constants() {
    let err = reject(
        "extern mut COUNTER: u32\n\
         codelet K(y: out [u32]) {\n\
             y[0] = COUNTER\n\
             y[1] = UNDEFINED\n\
         }",
    );
    assert_eq!(err.rule(), Rule::ExternalReference);
    assert_eq!(err.violations().len(), 2);
    assert!(err.violations()[0].detail.contains("mutable host variable `COUNTER`"));
    assert!(err.violations()[1].detail.contains("UNDEFINED"));
}

#[test]
fn every_violation_is_reported_in_order() {
    let err = reject(
        "fn helper(v) {\n return libm::cbrt(v)\n}\n\
         codelet K(x: in [f32], y: out [f32]) {\n\
             if x[0] > 0.0 {\n\
                 let tmp = new [u32; 8]\n\
             } else {\n\
                 y[0] = x.max()\n\
             }\n\
             y[1] = helper(x[1])\n\
         }",
    );
    let located: Vec<(Rule, &str)> = err.violations().iter().map(|v| (v.rule, v.location.as_str())).collect();
    assert_eq!(
        located,
        [
            (Rule::HeapAllocation, "compute/0/then/0"),
            (Rule::DynamicDispatch, "compute/0/else/0"),
            (Rule::ForeignCall, "helper helper/0"),
        ]
    );
    assert!(err.to_string().contains("(and 2 more)"));
}

#[test]
fn unbound_library_call_is_rejected_by_verify_alone() {
    // Without binding, even known shapes have no device implementation.
    let spec = KernelSpec::builder("K")
        .output("y", ElemType::F32)
        .body(vec![Stmt::store("y", Expr::int(0), Expr::library("sqrt", vec![Expr::float(2.0)]))])
        .build()
        .unwrap();
    assert_eq!(verify(&spec).unwrap_err().rule(), Rule::ForeignCall);

    let mut bound = spec.clone();
    intrinsics::bind(&mut bound);
    assert!(verify(&bound).is_ok());
    let Stmt::Store { value: Expr::Call(call), .. } = &bound.body()[0] else {
        panic!("expected a store of a call");
    };
    assert!(matches!(call.callee, Callee::Intrinsic(_)));
}

#[test]
fn rejected_kernel_produces_nothing() {
    let spec = parse_codelet("codelet K(y: out [f32]) {\n y[0] = runtime::jl_box(1)\n}").unwrap();
    match define_codelet(spec) {
        Ok(codelet) => panic!("`{}` should have been rejected", codelet),
        Err(err) => {
            assert_eq!(err.codelet, "K");
            assert!(!err.violations().is_empty());
        }
    }
}
