use ipu_codelet::emulator::{as_f32, f32_data, u32_data, FieldData};
use ipu_codelet::kernel::Scalar;
use ipu_codelet::timing::parse_cycle_reports;
use ipu_codelet::{define_codelet, parse_codelet, Codelet, Emulator, ExecutionError};

fn codelet(source: &str) -> Codelet {
    define_codelet(parse_codelet(source).unwrap()).unwrap()
}

fn data(fields: &[(&str, Vec<Scalar>)]) -> FieldData {
    fields.iter().map(|(name, values)| (name.to_string(), values.clone())).collect()
}

const NOISE: &str = "codelet Noise(y: out [f32]) {\n for i in 0 .. len(y) {\n y[i] = rand(f32)\n }\n}";

#[test]
fn scale_by_captured_constant() {
    let scale = codelet(
        "const FACTOR: f32 = 2.0\n\
         fn twice(v) {\n return v + v\n}\n\
         codelet Scale(x: in [f32], y: out [f32], count: out u32) {\n\
             for i in 0 .. len(x) {\n\
                 y[i] = twice(x[i]) * FACTOR\n\
             }\n\
             count = len(x)\n\
         }",
    );
    let mut fields = data(&[
        ("x", f32_data(&[1.0, -0.5, 3.0])),
        ("y", f32_data(&[0.0; 3])),
        ("count", u32_data(&[0])),
    ]);
    Emulator::new(0).run(&scale, &mut fields).unwrap();

    assert_eq!(as_f32(&fields["y"]).unwrap(), [4.0, -2.0, 12.0]);
    assert_eq!(fields["count"], u32_data(&[3]));
    // Inputs are untouched.
    assert_eq!(as_f32(&fields["x"]).unwrap(), [1.0, -0.5, 3.0]);
}

#[test]
fn uniform_floats_stay_in_unit_interval() {
    let noise = codelet(NOISE);
    let mut fields = data(&[("y", f32_data(&[-1.0; 4096]))]);
    Emulator::new(0).run(&noise, &mut fields).unwrap();

    let values = as_f32(&fields["y"]).unwrap();
    assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
    assert!((mean - 0.5).abs() < 0.05, "mean {}", mean);
    assert!(values.windows(2).any(|w| w[0] != w[1]));
}

#[test]
fn generator_is_seeded_per_tile() {
    let noise = codelet(NOISE);
    let run = |emulator: Emulator| {
        let mut emulator = emulator;
        let mut fields = data(&[("y", f32_data(&[0.0; 16]))]);
        emulator.run(&noise, &mut fields).unwrap();
        as_f32(&fields["y"]).unwrap()
    };

    assert_eq!(run(Emulator::new(3)), run(Emulator::new(3)));
    assert_ne!(run(Emulator::new(3)), run(Emulator::new(4)));
    assert_eq!(run(Emulator::new(9).with_seed(3)), run(Emulator::new(3)));
}

#[test]
fn cycles_blocks_report_through_print() {
    let timed = codelet(
        "codelet Timed(x: in [f32], y: out [f32]) {\n\
             @cycles \"copy\" {\n\
                 for i in 0 .. len(x) {\n\
                     y[i] = x[i]\n\
                 }\n\
             }\n\
         }",
    );
    let fields = || data(&[("x", f32_data(&[1.0; 8])), ("y", f32_data(&[0.0; 8]))]);

    let mut emulator = Emulator::new(0);
    let mut short = fields();
    emulator.run(&timed, &mut short).unwrap();
    let reports = parse_cycle_reports(emulator.output());
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].label, "copy");
    assert!(reports[0].cycles > 8);
    assert_eq!(as_f32(&short["y"]).unwrap(), [1.0; 8]);

    // Without print the block still runs but nothing is reported.
    let mut quiet = Emulator::new(0).print(false);
    let mut copied = fields();
    quiet.run(&timed, &mut copied).unwrap();
    assert!(quiet.output().is_empty());
    assert_eq!(as_f32(&copied["y"]).unwrap(), [1.0; 8]);
}

#[test]
fn show_prints_source_text() {
    let show = codelet("codelet Show(x: in [u32]) {\n @show(x[0] * 2)\n @println(\"flag \", x[0] > 1)\n}");
    let mut emulator = Emulator::new(0);
    let mut fields = data(&[("x", u32_data(&[21]))]);
    emulator.run(&show, &mut fields).unwrap();
    assert_eq!(emulator.take_output(), "x[0] * 2 = 42\nflag 1\n");
    assert!(emulator.output().is_empty());
}

#[test]
fn field_data_is_checked_before_running() {
    let noise = codelet(NOISE);

    let mut missing = FieldData::new();
    assert_eq!(
        Emulator::new(0).run(&noise, &mut missing).unwrap_err(),
        ExecutionError::MissingField { field: "y".into() }
    );

    let mut wrong = data(&[("y", u32_data(&[1, 2]))]);
    assert!(matches!(
        Emulator::new(0).run(&noise, &mut wrong).unwrap_err(),
        ExecutionError::FieldType { .. }
    ));
}

#[test]
fn runaway_loops_hit_the_step_limit() {
    let spin = codelet("codelet Spin(y: out [u32]) {\n while true {\n y[0] = y[0] + 1\n }\n}");
    let mut fields = data(&[("y", u32_data(&[0]))]);
    let err = Emulator::new(0).step_limit(1_000).run(&spin, &mut fields).unwrap_err();
    assert_eq!(err, ExecutionError::StepLimit(1_000));
}
