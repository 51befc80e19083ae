//! Parameter estimation: gamma identifiability, scaled negative binomial
//! sharing across heterogeneous exposures, and group propagation.

use std::any::Any;

use assert_approx_eq::assert_approx_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma as GammaSampler, Poisson};

use hmm_inference::{
    DiscreteEmission, DiscreteTransition, EmSequences, EmissionDistribution, EmissionTable,
    Emissions, GammaEmission, Hmm, HmmResult, HomogeneousTransitions, NegBinomialScaled,
    NonHomogeneousTransitions, Params, SeqIter, Sequence, TrainConfig, TransitionDistribution,
    TransitionPosteriors, TransitionTable,
};

#[test]
fn test_gamma_m_step_identifiability() {
    // 10000 i.i.d. Gamma(2.5, 3.0) observations, single state, posterior 1
    let mut rng = ChaCha20Rng::seed_from_u64(20240817);
    let sampler = GammaSampler::new(2.5, 3.0).unwrap();
    let values: Vec<f64> = (0..10_000).map(|_| sampler.sample(&mut rng)).collect();
    let seq = Sequence::from_values(values).unwrap();

    let transitions = HomogeneousTransitions::new(vec![Box::new(
        DiscreteTransition::with_probs(1, 0, &[0], &[1.0]).unwrap(),
    )])
    .unwrap();

    let mut emission = GammaEmission::new(0, 0);
    emission.set_params(&Params::new(&[1.0, 1.0])).unwrap();
    assert!(emission.set_option("maxIter", 20.0));
    let emissions = Emissions::new(vec![Box::new(emission)]).unwrap();

    let mut hmm = Hmm::new(transitions, emissions, &[1.0]).unwrap();

    // one EM iteration must recover the generating parameters
    hmm.em_iteration(&[seq], &[vec![(0, 0)]], &[vec![0]]).unwrap();

    let params = hmm.emissions().function(0, 0).get_params();
    assert!(
        (params[0] - 2.5).abs() < 0.1,
        "shape {} not within 0.1 of 2.5",
        params[0]
    );
    assert!(
        (params[1] - 3.0).abs() < 0.2,
        "scale {} not within 0.2 of 3.0",
        params[1]
    );
}

/// Covariate-driven deterministic switch: the transition into position t
/// lands on the state named by covariate slot 0 at t. Exercises the
/// non-homogeneous plug-in contract from the outside.
struct CovariateSwitch {
    n_states: usize,
    state_id: usize,
    targets: Vec<usize>,
}

impl CovariateSwitch {
    fn new(n_states: usize, state_id: usize) -> Self {
        Self {
            n_states,
            state_id,
            targets: (0..n_states).collect(),
        }
    }
}

impl TransitionDistribution for CovariateSwitch {
    fn n_states(&self) -> usize {
        self.n_states
    }

    fn state_id(&self) -> usize {
        self.state_id
    }

    fn targets(&self) -> &[usize] {
        &self.targets
    }

    fn valid_params(&self, params: &Params) -> bool {
        params.is_empty()
    }

    fn get_params(&self) -> Params {
        Params::new(&[])
    }

    fn set_params(&mut self, params: &Params) -> HmmResult<()> {
        if !self.valid_params(params) {
            return Err(hmm_inference::HmmError::InvalidParameters {
                family: "covariate_switch".to_string(),
                reason: "family has no free parameters".to_string(),
            });
        }
        Ok(())
    }

    fn get_option(&self, _name: &str) -> Option<f64> {
        None
    }

    fn set_option(&mut self, _name: &str, _value: f64) -> bool {
        false
    }

    fn log_probability(&self, _target: usize) -> f64 {
        // position-dependent family; meaningless without the iterator
        f64::NEG_INFINITY
    }

    fn log_probability_at(&self, iter: &SeqIter<'_>, target: usize) -> f64 {
        if iter.covar(0) as usize == target {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    fn update_params(
        &mut self,
        _stats: &TransitionPosteriors,
        _peers: &mut [&mut dyn TransitionDistribution],
    ) -> HmmResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn test_negbinomial_scale_sharing_recovers_ground_truth() {
    // two states with scales 1.0 and 2.0 sharing (m = 5, r = 4); the
    // scaled pmf is NB(size = s*r, p = m/(r+m)), sampled as a
    // gamma-poisson mixture
    let (m, r) = (5.0, 4.0);
    let p_ratio = m / r; // gamma scale p/(1-p)
    let mut rng = ChaCha20Rng::seed_from_u64(7_312_554);

    let half = 8_000usize;
    let mut emissions_data = Vec::with_capacity(2 * half);
    let mut covars = Vec::with_capacity(2 * half);
    for (state, scale) in [(0usize, 1.0f64), (1usize, 2.0f64)] {
        let mixing = GammaSampler::new(scale * r, p_ratio).unwrap();
        for _ in 0..half {
            let lambda: f64 = mixing.sample(&mut rng);
            let x: f64 = Poisson::new(lambda.max(1e-12)).unwrap().sample(&mut rng);
            emissions_data.push(x);
            covars.push(state as f64);
        }
    }
    let len = emissions_data.len();
    let seq = Sequence::new(len, &[1], emissions_data, &[1], covars).unwrap();

    let transitions = NonHomogeneousTransitions::new(vec![
        Box::new(CovariateSwitch::new(2, 0)),
        Box::new(CovariateSwitch::new(2, 1)),
    ])
    .unwrap();

    let mut nb0 = NegBinomialScaled::with_scale(0, 0, 1.0);
    let mut nb1 = NegBinomialScaled::with_scale(1, 0, 2.0);
    for nb in [&mut nb0, &mut nb1] {
        nb.set_params(&Params::new(&[1.0, 1.0])).unwrap();
        assert!(nb.set_option("momInit", 1.0));
    }
    let emissions = Emissions::new(vec![Box::new(nb0), Box::new(nb1)]).unwrap();

    let mut hmm = Hmm::new(transitions, emissions, &[1.0, 0.0]).unwrap();

    let report = hmm
        .train(
            &[seq],
            &[vec![(0, 0), (1, 0)]],
            &[],
            &TrainConfig {
                max_iterations: 20,
                tolerance: 1e-8,
            },
        )
        .unwrap();
    assert!(report.iterations <= 20);

    let params0 = hmm.emissions().function(0, 0).get_params();
    let params1 = hmm.emissions().function(1, 0).get_params();

    // both states hold identical parameters
    assert_eq!(params0.values(), params1.values());

    // and they match ground truth within 5%
    assert!(
        (params0[0] - m).abs() / m < 0.05,
        "mean {} not within 5% of {}",
        params0[0],
        m
    );
    assert!(
        (params0[1] - r).abs() / r < 0.05,
        "dispersion {} not within 5% of {}",
        params0[1],
        r
    );
}

#[test]
fn test_four_way_group_propagation_is_bit_identical() {
    const N: usize = 4;

    // varied positive observations keep the gamma M-step well-posed
    let values: Vec<f64> = (0..240).map(|i| 0.5 + (i % 7) as f64 * 0.75).collect();
    let seq = Sequence::from_values(values).unwrap();

    let transitions = HomogeneousTransitions::new(
        (0..N)
            .map(|i| {
                Box::new(
                    DiscreteTransition::with_probs(
                        N,
                        i,
                        &[0, 1, 2, 3],
                        &[0.25, 0.25, 0.25, 0.25],
                    )
                    .unwrap(),
                ) as Box<dyn TransitionDistribution>
            })
            .collect(),
    )
    .unwrap();

    // members start from different parameters on purpose
    let starts = [[1.0, 1.0], [2.0, 1.0], [3.0, 2.0], [0.5, 4.0]];
    let emissions = Emissions::new(
        (0..N)
            .map(|i| {
                let mut e = GammaEmission::new(i, 0);
                e.set_params(&Params::new(&starts[i])).unwrap();
                Box::new(e) as Box<dyn EmissionDistribution>
            })
            .collect(),
    )
    .unwrap();

    let mut hmm = Hmm::new(transitions, emissions, &[0.25, 0.25, 0.25, 0.25]).unwrap();

    hmm.em_iteration(
        &[seq],
        &[vec![(0, 0), (1, 0), (2, 0), (3, 0)]],
        &[vec![0, 1, 2, 3]],
    )
    .unwrap();

    // all four emission members observe identical parameter state
    let reference = hmm.emissions().function(0, 0).get_params();
    assert_ne!(reference.values(), &starts[0]); // the update actually ran
    for i in 1..N {
        let params = hmm.emissions().function(i, 0).get_params();
        assert_eq!(reference.values(), params.values());
    }

    // the tied transition group propagates identically as well
    let t_reference = hmm.transitions().function(0).get_params();
    for i in 1..N {
        let params = hmm.transitions().function(i).get_params();
        assert_eq!(t_reference.values(), params.values());
    }
}

#[test]
fn test_idempotent_m_step_on_pure_posterior() {
    // discrete emission with all posterior mass in one state: a second EM
    // iteration leaves parameters unchanged within tolerance
    let transitions = HomogeneousTransitions::new(vec![Box::new(
        DiscreteTransition::with_probs(1, 0, &[0], &[1.0]).unwrap(),
    )])
    .unwrap();
    let emissions = Emissions::new(vec![Box::new(
        DiscreteEmission::with_probs(0, 0, &[0.5, 0.5]).unwrap(),
    )])
    .unwrap();
    let mut hmm = Hmm::new(transitions, emissions, &[1.0]).unwrap();

    let seq = Sequence::from_values(vec![0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0]).unwrap();

    hmm.em_iteration(&[seq.clone()], &[vec![(0, 0)]], &[vec![0]])
        .unwrap();
    let first = hmm.emissions().function(0, 0).get_params();
    // frequencies of the observed symbols: 3/8 and 5/8
    assert_approx_eq!(first[0], 3.0 / 8.0, 1e-12);
    assert_approx_eq!(first[1], 5.0 / 8.0, 1e-12);

    hmm.em_iteration(&[seq], &[vec![(0, 0)]], &[vec![0]])
        .unwrap();
    let second = hmm.emissions().function(0, 0).get_params();
    for i in 0..first.len() {
        assert_approx_eq!(first[i], second[i], 1e-9);
    }
}

/// EmSequences is part of the plug-in surface; a distribution written
/// outside the crate can walk posterior visits.
#[test]
fn test_posterior_visits_expose_sequence_data() {
    fn weight_sum(seqs: &EmSequences<'_>, state: usize) -> f64 {
        let mut total = 0.0;
        for visit in seqs.posteriors(state) {
            let mut it = visit.iter;
            it.reset_first();
            for &w in visit.weights {
                total += w;
                it.next();
            }
        }
        total
    }

    // reuse the driver through a tiny custom emission family
    struct Probe {
        state_id: usize,
        observed: f64,
    }
    impl EmissionDistribution for Probe {
        fn state_id(&self) -> usize {
            self.state_id
        }
        fn slot_id(&self) -> usize {
            0
        }
        fn valid_params(&self, params: &Params) -> bool {
            params.is_empty()
        }
        fn get_params(&self) -> Params {
            Params::new(&[])
        }
        fn set_params(&mut self, _params: &Params) -> HmmResult<()> {
            Ok(())
        }
        fn get_option(&self, _name: &str) -> Option<f64> {
            None
        }
        fn set_option(&mut self, _name: &str, _value: f64) -> bool {
            false
        }
        fn log_probability(&self, _iter: &SeqIter<'_>) -> f64 {
            (0.5f64).ln()
        }
        fn update_params(
            &mut self,
            sequences: &EmSequences<'_>,
            _peers: &mut [&mut dyn EmissionDistribution],
        ) -> HmmResult<()> {
            self.observed = weight_sum(sequences, self.state_id);
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    let transitions = HomogeneousTransitions::new(vec![Box::new(
        DiscreteTransition::with_probs(1, 0, &[0], &[1.0]).unwrap(),
    )])
    .unwrap();
    let emissions = Emissions::new(vec![Box::new(Probe {
        state_id: 0,
        observed: 0.0,
    })])
    .unwrap();
    let mut hmm = Hmm::new(transitions, emissions, &[1.0]).unwrap();

    let seq = Sequence::from_values(vec![0.0; 12]).unwrap();
    hmm.em_iteration(&[seq], &[vec![(0, 0)]], &[]).unwrap();

    // single state: posterior weight is 1 at each of the 12 positions
    let probe = hmm
        .emissions()
        .function(0, 0)
        .as_any()
        .downcast_ref::<Probe>()
        .unwrap();
    assert_approx_eq!(probe.observed, 12.0, 1e-9);
}
