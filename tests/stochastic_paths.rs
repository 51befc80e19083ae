//! Stochastic backtrace: empirical marginals against the exact state
//! posterior.

use std::sync::Mutex;

use hmm_inference::{
    rng, DiscreteEmission, DiscreteTransition, EmissionDistribution, Emissions, Hmm,
    HomogeneousTransitions, Sequence, TransitionDistribution,
};

const N: usize = 3;
const DRAWS: usize = 10_000;

// every test here seeds the process-wide generator; serialise them
static RNG_LOCK: Mutex<()> = Mutex::new(());

fn three_state_hmm() -> Hmm<HomogeneousTransitions, Emissions> {
    let rows: [[f64; 3]; 3] = [
        [0.5, 0.25, 0.25],
        [0.25, 0.5, 0.25],
        [0.25, 0.25, 0.5],
    ];
    let transitions = HomogeneousTransitions::new(
        (0..N)
            .map(|i| {
                Box::new(DiscreteTransition::with_probs(N, i, &[0, 1, 2], &rows[i]).unwrap())
                    as Box<dyn TransitionDistribution>
            })
            .collect(),
    )
    .unwrap();

    let emission_rows: [[f64; 3]; 3] = [
        [0.5, 0.25, 0.25],
        [0.25, 0.5, 0.25],
        [0.125, 0.375, 0.5],
    ];
    let emissions = Emissions::new(
        (0..N)
            .map(|i| {
                Box::new(DiscreteEmission::with_probs(i, 0, &emission_rows[i]).unwrap())
                    as Box<dyn EmissionDistribution>
            })
            .collect(),
    )
    .unwrap();

    Hmm::new(transitions, emissions, &[0.5, 0.25, 0.25]).unwrap()
}

#[test]
fn test_backtrace_marginals_match_state_posterior() {
    let _guard = RNG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let hmm = three_state_hmm();
    let seq = Sequence::from_values(vec![0.0, 1.0, 2.0, 1.0, 0.0, 2.0]).unwrap();
    let len = seq.len();

    let mut fw = vec![0.0; N * len];
    let mut bk = vec![0.0; N * len];
    hmm.forward(&mut seq.iter(), &mut fw).unwrap();
    hmm.backward(&mut seq.iter(), &mut bk).unwrap();

    let mut posterior = vec![0.0; N * len];
    hmm.state_posterior(&seq.iter(), &fw, &bk, &mut posterior)
        .unwrap();

    rng::set_seed(987_654_321);
    let mut counts = vec![0usize; N * len];
    let mut path = vec![0usize; len];
    for _ in 0..DRAWS {
        hmm.stochastic_backtrace(&mut seq.iter(), &fw, &mut path)
            .unwrap();
        for (t, &state) in path.iter().enumerate() {
            counts[state * len + t] += 1;
        }
    }

    // empirical marginal per position within 3 standard errors of the
    // exact posterior (plus a small guard for the finite draw count)
    for t in 0..len {
        for k in 0..N {
            let p = posterior[k * len + t];
            let freq = counts[k * len + t] as f64 / DRAWS as f64;
            let se = (p * (1.0 - p) / DRAWS as f64).sqrt();
            let tol = 3.0 * se + 2e-3;
            assert!(
                (freq - p).abs() <= tol,
                "position {} state {}: freq {} vs posterior {} (tol {})",
                t,
                k,
                freq,
                p,
                tol
            );
        }
    }
}

#[test]
fn test_backtrace_is_reproducible_under_seeding() {
    let _guard = RNG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let hmm = three_state_hmm();
    let seq = Sequence::from_values(vec![0.0, 2.0, 1.0, 1.0]).unwrap();
    let len = seq.len();

    let mut fw = vec![0.0; N * len];
    hmm.forward(&mut seq.iter(), &mut fw).unwrap();

    rng::set_seed(1111);
    let mut first = vec![0usize; len];
    hmm.stochastic_backtrace(&mut seq.iter(), &fw, &mut first)
        .unwrap();

    rng::set_seed(1111);
    let mut second = vec![0usize; len];
    hmm.stochastic_backtrace(&mut seq.iter(), &fw, &mut second)
        .unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_backtrace_respects_forbidden_transitions() {
    let _guard = RNG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // left-to-right chain: sampled paths must be monotone
    let transitions = HomogeneousTransitions::new(
        (0..N)
            .map(|i| {
                let f: Box<dyn TransitionDistribution> = if i + 1 < N {
                    Box::new(
                        DiscreteTransition::with_probs(N, i, &[i, i + 1], &[0.5, 0.5]).unwrap(),
                    )
                } else {
                    Box::new(DiscreteTransition::with_probs(N, i, &[i], &[1.0]).unwrap())
                };
                f
            })
            .collect(),
    )
    .unwrap();
    let emissions = Emissions::new(
        (0..N)
            .map(|i| {
                Box::new(DiscreteEmission::with_probs(i, 0, &[0.5, 0.5]).unwrap())
                    as Box<dyn EmissionDistribution>
            })
            .collect(),
    )
    .unwrap();
    let mut init = vec![0.0; N];
    init[0] = 1.0;
    let hmm = Hmm::new(transitions, emissions, &init).unwrap();

    let seq = Sequence::from_values(vec![0.0, 1.0, 0.0, 1.0, 1.0]).unwrap();
    let len = seq.len();
    let mut fw = vec![0.0; N * len];
    hmm.forward(&mut seq.iter(), &mut fw).unwrap();

    rng::set_seed(4242);
    let mut path = vec![0usize; len];
    for _ in 0..500 {
        hmm.stochastic_backtrace(&mut seq.iter(), &fw, &mut path)
            .unwrap();
        assert_eq!(path[0], 0);
        for t in 1..len {
            assert!(
                path[t] == path[t - 1] || path[t] == path[t - 1] + 1,
                "forbidden back-edge in sampled path {:?}",
                path
            );
        }
    }
}
