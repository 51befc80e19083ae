//! Process-wide factory registry mapping family names to constructors.
//!
//! External layers construct distribution instances by name. Registration
//! is an explicit call (no constructor-time side effects); packages can
//! tear their families down in bulk with [`unregister_all`].

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::distribution::{EmissionDistribution, TransitionDistribution};
use crate::emissions::{DiscreteEmission, GammaEmission, NegBinomialScaled};
use crate::errors::{HmmError, HmmResult};
use crate::transitions::DiscreteTransition;

/// Emission constructor signature.
pub type EmissionFactory =
    fn(state_id: usize, slot_id: usize, dim: usize) -> Box<dyn EmissionDistribution>;

/// Transition constructor signature.
pub type TransitionFactory =
    fn(n_states: usize, state_id: usize, targets: &[usize]) -> Box<dyn TransitionDistribution>;

/// One registered distribution family.
///
/// Only the constructors the family supports are populated; a family may
/// provide both an emission and a transition form under one name.
#[derive(Clone)]
pub struct FamilyEntry {
    /// Owning package, used for bulk deregistration.
    pub package: String,
    /// Family name used for lookup.
    pub name: String,
    /// Whether instances read covariates.
    pub needs_covars: bool,
    /// Emission constructor, if the family has one.
    pub emission: Option<EmissionFactory>,
    /// Transition constructor, if the family has one.
    pub transition: Option<TransitionFactory>,
}

static REGISTRY: Lazy<RwLock<HashMap<String, FamilyEntry>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register (or replace) a family entry.
pub fn register(entry: FamilyEntry) {
    REGISTRY.write().insert(entry.name.clone(), entry);
}

/// Remove every family registered by `package`.
pub fn unregister_all(package: &str) {
    REGISTRY.write().retain(|_, e| e.package != package);
}

/// Look a family up by name.
pub fn lookup(name: &str) -> HmmResult<FamilyEntry> {
    REGISTRY
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| HmmError::UnknownFamily {
            name: name.to_string(),
        })
}

/// Construct an emission instance of the named family.
pub fn create_emission(
    name: &str,
    state_id: usize,
    slot_id: usize,
    dim: usize,
) -> HmmResult<Box<dyn EmissionDistribution>> {
    let entry = lookup(name)?;
    let factory = entry.emission.ok_or_else(|| HmmError::InvalidParameters {
        family: name.to_string(),
        reason: "family has no emission constructor".to_string(),
    })?;
    Ok(factory(state_id, slot_id, dim))
}

/// Construct a transition instance of the named family.
pub fn create_transition(
    name: &str,
    n_states: usize,
    state_id: usize,
    targets: &[usize],
) -> HmmResult<Box<dyn TransitionDistribution>> {
    let entry = lookup(name)?;
    let factory = entry
        .transition
        .ok_or_else(|| HmmError::InvalidParameters {
            family: name.to_string(),
            reason: "family has no transition constructor".to_string(),
        })?;
    Ok(factory(n_states, state_id, targets))
}

/// Register the built-in reference families under package `"builtin"`.
pub fn register_builtin_families() {
    register(FamilyEntry {
        package: "builtin".to_string(),
        name: "discrete".to_string(),
        needs_covars: false,
        emission: Some(|state_id, slot_id, _dim| Box::new(DiscreteEmission::new(state_id, slot_id))),
        transition: Some(|n_states, state_id, targets| {
            Box::new(DiscreteTransition::new(n_states, state_id, targets))
        }),
    });
    register(FamilyEntry {
        package: "builtin".to_string(),
        name: "gamma".to_string(),
        needs_covars: false,
        emission: Some(|state_id, slot_id, _dim| Box::new(GammaEmission::new(state_id, slot_id))),
        transition: None,
    });
    register(FamilyEntry {
        package: "builtin".to_string(),
        name: "negbinomial_scaled".to_string(),
        needs_covars: false,
        emission: Some(|state_id, slot_id, _dim| {
            Box::new(NegBinomialScaled::new(state_id, slot_id))
        }),
        transition: None,
    });
}
