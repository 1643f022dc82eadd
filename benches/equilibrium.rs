use blpsim::ids::build_id_data;
use blpsim::integration::Agents;
use blpsim::parameters::Parameters;
use blpsim::{EquilibriumOptions, Simulation, SimulationConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::{DMatrix, DVector};

fn simulation() -> Simulation {
    let ids = build_id_data(50, 20, 10).expect("valid layout");
    let agents = Agents::product_rule(7, 1).expect("product rule");
    let parameters = Parameters::logit(DVector::from_vec(vec![1.0, 0.5]), -2.0)
        .with_sigma(DMatrix::from_element(1, 1, 1.0))
        .with_gamma(DVector::from_vec(vec![1.0, 0.5, 0.5]));
    let config = SimulationConfig {
        nonlinear_columns: vec![1],
        seed: 1,
        ..SimulationConfig::default()
    };
    Simulation::new(ids, agents, parameters, config).expect("valid simulation")
}

fn bench_equilibrium(c: &mut Criterion) {
    let simulation = simulation();
    let mut group = c.benchmark_group("zeta_markup");
    for parallel in [false, true] {
        let options = EquilibriumOptions::default().with_parallel(parallel);
        let name = if parallel { "parallel" } else { "sequential" };
        group.bench_function(name, |b| {
            b.iter(|| {
                simulation
                    .replace_endogenous(black_box(&options))
                    .expect("converged")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_equilibrium);
criterion_main!(benches);
