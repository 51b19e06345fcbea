use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use less_forge::{compile, CompileOptions};
use std::path::PathBuf;

struct Case {
    name: &'static str,
    source: &'static str,
    compress: bool,
    /// 含相对 @import 的用例需要指定所在目录。
    imports: bool,
}

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

fn compile_benchmarks(c: &mut Criterion) {
    let cases = [
        Case {
            name: "baseline_pretty",
            source: include_str!("../fixtures/benchmark.less"),
            compress: false,
            imports: false,
        },
        Case {
            name: "baseline_compressed",
            source: include_str!("../fixtures/benchmark.less"),
            compress: true,
            imports: false,
        },
        Case {
            name: "import_pretty",
            source: include_str!("../fixtures/import.less"),
            compress: false,
            imports: true,
        },
        Case {
            name: "import_compressed",
            source: include_str!("../fixtures/import.less"),
            compress: true,
            imports: true,
        },
        Case {
            name: "mixins_pretty",
            source: include_str!("../fixtures/mixins.less"),
            compress: false,
            imports: false,
        },
        Case {
            name: "mixins_compressed",
            source: include_str!("../fixtures/mixins.less"),
            compress: true,
            imports: false,
        },
        Case {
            name: "arithmetic_pretty",
            source: include_str!("../fixtures/arithmetic.less"),
            compress: false,
            imports: false,
        },
        Case {
            name: "arithmetic_compressed",
            source: include_str!("../fixtures/arithmetic.less"),
            compress: true,
            imports: false,
        },
    ];

    for case in cases {
        bench_case(c, &case);
    }
}

fn bench_case(c: &mut Criterion, case: &Case) {
    let mut group = c.benchmark_group(format!("less_compile/{}", case.name));
    group.throughput(Throughput::Bytes(case.source.len() as u64));

    let current_dir = case.imports.then(fixtures_dir);
    let id = BenchmarkId::new(case.name, if case.compress { "min" } else { "pretty" });
    group.bench_with_input(id, &case.compress, |b, &compress| {
        b.iter(|| {
            compile(
                case.source,
                CompileOptions {
                    compress,
                    hide_warnings: true,
                    current_dir: current_dir.clone(),
                    ..CompileOptions::default()
                },
            )
            .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, compile_benchmarks);
criterion_main!(benches);
