use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use spicy_devices::{
    Capacitor, CapacitorModel, CircuitState, Devices, Diode, DiodeModel, MatrixLayout, Model,
    NodeIndex, Resistor, ResistorModel, SourceModel, Tolerances, VoltageSource,
};

const SIZES: [usize; 3] = [10, 100, 1000];

/// RC ladder with a diode clamp on every rung, driven by one voltage source.
fn ladder(rungs: usize, layout: MatrixLayout) -> Devices {
    let mut devices = Devices::new(layout);
    let mut resistors = Model::new("rmod", ResistorModel::default());
    let mut capacitors = Model::new("cmod", CapacitorModel::default());
    let mut diodes = Model::new("dmod", DiodeModel::default());

    let input = devices.node("in");
    let mut previous = input;
    for k in 0..rungs {
        let node = devices.node(&format!("n{k}"));
        resistors.add_instance(format!("R{k}"), Resistor::new(previous, node, 1e3));
        capacitors.add_instance(format!("C{k}"), Capacitor::new(node, NodeIndex::GROUND, 1e-12));
        diodes.add_instance(format!("D{k}"), Diode::new(node, NodeIndex::GROUND));
        previous = node;
    }

    devices.add_model(resistors);
    devices.add_model(capacitors);
    devices.add_model(diodes);
    devices.add_model(
        Model::new("vmod", SourceModel).with_instance("V1", VoltageSource::new(input, NodeIndex::GROUND, 1.0)),
    );
    devices
}

fn bench_setup(c: &mut Criterion) {
    let mut group = c.benchmark_group("devices/setup");
    for rungs in SIZES {
        group.throughput(Throughput::Elements(rungs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rungs), &rungs, |b, &rungs| {
            b.iter_batched(
                || ladder(rungs, MatrixLayout::Sparse),
                |mut devices| {
                    let mut ckt = CircuitState::new(Tolerances::default(), Default::default());
                    black_box(devices.setup(&mut ckt).expect("setup"));
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_load(c: &mut Criterion) {
    for layout in [MatrixLayout::Sparse, MatrixLayout::Dense] {
        let mut group = c.benchmark_group(format!("devices/load/{layout:?}").to_lowercase());
        for rungs in SIZES {
            if layout == MatrixLayout::Dense && rungs > 100 {
                continue;
            }
            let mut devices = ladder(rungs, layout);
            let mut ckt = CircuitState::new(Tolerances::default(), Default::default());
            let mut mna = devices.setup(&mut ckt).expect("setup");
            // slot 0 is ground
            for (k, v) in ckt.solution.iter_mut().enumerate().skip(1) {
                *v = 0.3 + 1e-4 * k as f64;
            }

            group.throughput(Throughput::Elements(rungs as u64));
            group.bench_function(BenchmarkId::from_parameter(rungs), |b| {
                b.iter(|| {
                    mna.clear();
                    devices.load(&mut mna, &mut ckt).expect("load");
                    black_box(&mna);
                });
            });
        }
        group.finish();
    }
}

criterion_group!(device_load, bench_setup, bench_load);
criterion_main!(device_load);
