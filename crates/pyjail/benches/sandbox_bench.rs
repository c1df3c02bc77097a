// crates/pyjail/benches/sandbox_bench.rs
//
// Three Criterion benchmark groups:
//   lifecycle  — create + dispose of an empty sandbox
//   execute    — snippets against one long-lived sandbox
//   revocation — remove + grant of a builtin with module views issued

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pyjail::{Sandbox, SandboxSettings};
use std::time::Duration;

/// Arithmetic sum of squares.
const SNIPPET_ARITH: &str = "sum(i*i for i in range(1000))";

/// String ops.
const SNIPPET_STRINGS: &str = concat!(
    "words = \"the quick brown fox jumps over the lazy dog\".split()\n",
    "\" \".join(w.capitalize() for w in words)"
);

/// Allowlisted import plus finalizable class.
const SNIPPET_IMPORT: &str = concat!(
    "import math\n",
    "class Res:\n",
    "    def __del__(self):\n",
    "        pass\n",
    "r = Res()\n",
    "math.floor(math.pi * 100)"
);

fn lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("create_dispose", |b| {
        b.iter(|| {
            let sandbox = Sandbox::create(SandboxSettings::default()).expect("create");
            black_box(sandbox.dispose())
        })
    });
    group.finish();
}

fn execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    group.warm_up_time(Duration::from_millis(500));

    let mut sandbox = Sandbox::new().expect("create");
    for (name, snippet) in [
        ("arith", SNIPPET_ARITH),
        ("strings", SNIPPET_STRINGS),
        ("import", SNIPPET_IMPORT),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let outcome = sandbox.execute(black_box(snippet));
                assert!(outcome.is_ok(), "{name}: {:?}", outcome.error);
                outcome
            })
        });
    }
    group.finish();
    sandbox.dispose();
}

fn revocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("revocation");

    let settings = SandboxSettings {
        allowed_modules: vec!["math".into(), "builtins".into()],
        ..SandboxSettings::default()
    };
    let mut sandbox = Sandbox::create(settings).expect("create");
    let outcome = sandbox.execute("import math, builtins");
    assert!(outcome.is_ok(), "{:?}", outcome.error);

    group.bench_function("remove_grant_len", |b| {
        b.iter(|| {
            let mut caps = sandbox.capabilities();
            black_box(caps.remove("len"));
            caps.grant("len").expect("len exists on the host");
        })
    });
    group.finish();
    sandbox.dispose();
}

criterion_group!(benches, lifecycle, execute, revocation);
criterion_main!(benches);
