#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};
use tempfile::TempDir;

use ipu_codelet::build::Toolchain;
use ipu_codelet::{
    define_codelet, load_object, parse_codelet, BuildConfig, Codelet, CodeletError, Orchestrator, TargetDesc,
    ToolchainError,
};

/// A relocatable ELF object defining `symbol`.
fn object_defining(symbol: &str) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &[0xC3], 1);
    obj.add_symbol(Symbol {
        name: symbol.as_bytes().to_vec(),
        value: offset,
        size: 1,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    obj.write().unwrap()
}

fn scale() -> Codelet {
    define_codelet(
        parse_codelet(
            "codelet Scale(x: in [f32], y: out [f32]) {\n\
                 for i in 0 .. len(x) {\n\
                     y[i] = x[i] * 2.0\n\
                 }\n\
             }",
        )
        .unwrap(),
    )
    .unwrap()
}

/// A fake toolchain: a shell script that logs its arguments and then runs `action`
/// with `$out` set to the path given after `-o`.
struct StubToolchain {
    dir: TempDir,
    work_root: PathBuf,
}

impl StubToolchain {
    fn new(action: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("invocations.log");
        let script = format!(
            "#!/bin/sh\n\
             echo \"$*\" >> '{}'\n\
             out=\"\"\n\
             while [ $# -gt 0 ]; do\n\
                 if [ \"$1\" = \"-o\" ]; then\n\
                     out=\"$2\"\n\
                 fi\n\
                 shift\n\
             done\n\
             {}\n",
            log.display(),
            action
        );
        fs::write(dir.path().join("popc.sh"), script).unwrap();
        let work_root = dir.path().join("work");
        fs::create_dir(&work_root).unwrap();
        Self { dir, work_root }
    }

    /// Copies `fixture` to the output path after `delay` seconds.
    fn producing(fixture: &[u8], delay: &str) -> Self {
        let stub = Self::new(&format!("sleep {}\ncp \"$(dirname \"$0\")/fixture.o\" \"$out\"", delay));
        fs::write(stub.dir.path().join("fixture.o"), fixture).unwrap();
        stub
    }

    fn script(&self) -> PathBuf {
        self.dir.path().join("popc.sh")
    }

    fn config(&self) -> BuildConfig {
        BuildConfig::default().work_root(&self.work_root).progress(false)
    }

    // The script is run through sh rather than executed directly, so a file
    // that was just written is never exec'd.
    fn orchestrator(&self, config: BuildConfig) -> Orchestrator {
        let mut flags = vec![self.script().display().to_string()];
        flags.extend(config.extra_flags.iter().cloned());
        let config = config.extra_flags(flags);
        Orchestrator::new(config)
            .with_toolchain(Toolchain::new("/bin/sh").with_poll_interval(Duration::from_millis(10)))
    }

    fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("invocations.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn leftover_sessions(&self) -> usize {
        fs::read_dir(&self.work_root).unwrap().count()
    }
}

fn toolchain_error(err: CodeletError) -> ToolchainError {
    match err {
        CodeletError::Toolchain(err) => err,
        other => panic!("expected a toolchain error, got {}", other),
    }
}

#[test]
fn builds_and_loads_object() {
    let fixture = object_defining("__runCodelet_Scale");
    let stub = StubToolchain::producing(&fixture, "0");
    let orchestrator = stub.orchestrator(stub.config());

    let built = orchestrator.build(&scale(), &TargetDesc::ipu2()).unwrap();
    assert_eq!(built.object, fixture);
    assert_eq!(built.artifact.codelet, "Scale");
    assert!(built.kept_dir.is_none());
    assert_eq!(stub.leftover_sessions(), 0);

    let invocations = stub.invocations();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].starts_with("-X -Wno-override-module --target ipu2 "));
    assert!(invocations[0].contains("Scale.cpp"));
    assert!(invocations[0].contains("Scale.ll -o "));
    assert!(invocations[0].ends_with("Scale.gp"));
}

#[test]
fn extra_flags_come_first() {
    let stub = StubToolchain::producing(&object_defining("__runCodelet_Scale"), "0");
    let orchestrator = stub.orchestrator(stub.config().extra_flags(["-O2", "-g"]));

    orchestrator.build(&scale(), &TargetDesc::ipu21()).unwrap();
    assert!(stub.invocations()[0].starts_with("-O2 -g -X -Wno-override-module --target ipu21 "));
}

#[test]
fn identical_builds_are_cached() {
    let stub = StubToolchain::producing(&object_defining("__runCodelet_Scale"), "0");
    let orchestrator = stub.orchestrator(stub.config());
    let target = TargetDesc::ipu2();

    let first = orchestrator.build(&scale(), &target).unwrap();
    let second = orchestrator.build(&scale(), &target).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(stub.invocations().len(), 1);

    let other_target = orchestrator.build(&scale(), &TargetDesc::ipu21()).unwrap();
    assert_ne!(other_target.fingerprint, first.fingerprint);
    assert_eq!(stub.invocations().len(), 2);

    let compiled = orchestrator.compile(&scale(), &target).unwrap();
    assert!(Arc::ptr_eq(&compiled, &first.artifact));
}

#[test]
fn concurrent_builds_run_the_toolchain_once() {
    let stub = StubToolchain::producing(&object_defining("__runCodelet_Scale"), "0.3");
    let orchestrator = stub.orchestrator(stub.config());
    let codelet = scale();
    let target = TargetDesc::ipu2();

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| orchestrator.build(&codelet, &target).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(stub.invocations().len(), 1);
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
}

#[test]
fn failures_carry_exit_code_and_diagnostics() {
    let stub = StubToolchain::new("echo 'Scale.cpp:4: error: no member named compute' >&2\nexit 3");
    let orchestrator = stub.orchestrator(stub.config());

    let err = toolchain_error(orchestrator.build(&scale(), &TargetDesc::ipu2()).unwrap_err());
    assert_eq!(err.exit_code(), Some(3));
    assert_eq!(err.diagnostics(), Some("Scale.cpp:4: error: no member named compute"));
    assert!(err.to_string().contains("exited with status 3"));
    assert_eq!(stub.leftover_sessions(), 0);

    // Failures are not cached.
    assert!(orchestrator.build(&scale(), &TargetDesc::ipu2()).is_err());
    assert_eq!(stub.invocations().len(), 2);
}

#[test]
fn kept_files_survive_the_build() {
    let stub = StubToolchain::producing(&object_defining("__runCodelet_Scale"), "0");
    let orchestrator = stub.orchestrator(stub.config().keep_files(true));

    let built = orchestrator.build(&scale(), &TargetDesc::ipu2()).unwrap();
    let kept = built.kept_dir.clone().unwrap();
    assert!(kept.starts_with(&stub.work_root));
    for name in ["Scale.ll", "Scale.cpp", "Scale.gp"] {
        assert!(kept.join(name).is_file(), "{} missing", name);
    }
    let module = fs::read_to_string(kept.join("Scale.ll")).unwrap();
    assert_eq!(module, built.artifact.module);
}

#[test]
fn kept_files_survive_a_failure() {
    let stub = StubToolchain::new("exit 1");
    let orchestrator = stub.orchestrator(stub.config().keep_files(true));

    assert!(orchestrator.build(&scale(), &TargetDesc::ipu2()).is_err());
    assert_eq!(stub.leftover_sessions(), 1);
}

#[test]
fn object_must_export_the_vertex() {
    let stub = StubToolchain::producing(&object_defining("some_other_symbol"), "0");
    let orchestrator = stub.orchestrator(stub.config());
    let err = toolchain_error(orchestrator.build(&scale(), &TargetDesc::ipu2()).unwrap_err());
    assert!(matches!(&err, ToolchainError::MissingSymbol { symbol, .. } if symbol == "__runCodelet_Scale"));

    let stub = StubToolchain::new("echo 'not an object' > \"$out\"");
    let orchestrator = stub.orchestrator(stub.config());
    let err = toolchain_error(orchestrator.build(&scale(), &TargetDesc::ipu2()).unwrap_err());
    assert!(matches!(err, ToolchainError::InvalidObject { .. }));
}

#[test]
fn compute_symbol_is_accepted_too() {
    let dir = tempfile::tempdir().unwrap();
    let stub = StubToolchain::new("true");
    let artifact = stub.orchestrator(stub.config()).compile(&scale(), &TargetDesc::ipu2()).unwrap();

    let path: &Path = &dir.path().join("Scale.gp");
    fs::write(path, object_defining(&artifact.symbol)).unwrap();
    assert!(load_object(path, &artifact).is_ok());

    let err = load_object(&dir.path().join("missing.gp"), &artifact).unwrap_err();
    assert!(matches!(err, ToolchainError::Io { .. }));
}

#[test]
fn keeping_files_is_not_served_from_a_plain_build() {
    let stub = StubToolchain::producing(&object_defining("__runCodelet_Scale"), "0");
    let orchestrator = stub.orchestrator(stub.config());
    let target = TargetDesc::ipu2();
    let codelet = scale();

    let plain = orchestrator.build(&codelet, &target).unwrap();
    assert!(plain.kept_dir.is_none());

    let keep = orchestrator.config().clone().keep_files(true);
    let kept = orchestrator.build_with(&codelet, &target, &keep).unwrap();
    let dir = kept.kept_dir.clone().unwrap();
    assert!(dir.join("Scale.ll").is_file());
    assert_eq!(stub.invocations().len(), 2);

    // Both variants are cached from here on.
    let again = orchestrator.build_with(&codelet, &target, &keep).unwrap();
    assert!(Arc::ptr_eq(&again, &kept));
    assert!(Arc::ptr_eq(&orchestrator.build(&codelet, &target).unwrap(), &plain));
    assert_eq!(stub.invocations().len(), 2);
}
