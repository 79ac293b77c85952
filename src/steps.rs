//! Automatic provisioning step sequences.
//!
//! The configured sequence is validated against the security ordering rules
//! before auto mode may use it, and the same projection drives the
//! completion predicate: a target is done once applying the sequence to its
//! observed facets would change nothing.

use crate::device::ProvisionState;
use std::str::FromStr;
use strum::{Display, EnumString};

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum ProvisionStep {
    FuseVbootKey,
    FusePermAttr,
    LockAvb,
    UnlockAvb,
    ProvisionProduct,
    ProvisionSom,
}

pub const DEFAULT_PRODUCT_STEPS: [ProvisionStep; 4] = [
    ProvisionStep::FuseVbootKey,
    ProvisionStep::FusePermAttr,
    ProvisionStep::LockAvb,
    ProvisionStep::ProvisionProduct,
];

pub const DEFAULT_SOM_STEPS: [ProvisionStep; 2] =
    [ProvisionStep::FuseVbootKey, ProvisionStep::ProvisionSom];

/// Parse configured step names. An unknown token is a syntax error, reported
/// separately from a sequence that parses but violates the security rules.
pub fn parse_steps(names: &[String]) -> Result<Vec<ProvisionStep>, String> {
    names
        .iter()
        .map(|name| ProvisionStep::from_str(name).map_err(|_| name.clone()))
        .collect()
}

/// Project one step onto a state, unconditionally.
fn apply(step: ProvisionStep, state: &mut ProvisionState) {
    match step {
        ProvisionStep::FuseVbootKey => state.bootloader_locked = true,
        ProvisionStep::FusePermAttr => state.avb_perm_attr_set = true,
        ProvisionStep::LockAvb => state.avb_locked = true,
        ProvisionStep::UnlockAvb => state.avb_locked = false,
        ProvisionStep::ProvisionProduct => state.product_provisioned = true,
        ProvisionStep::ProvisionSom => state.som_provisioned = true,
    }
}

/// Simulate the sequence on a fresh device and check that no step runs
/// before its prerequisites or repeats a one-shot fuse.
pub fn validate_security(steps: &[ProvisionStep]) -> bool {
    let mut state = ProvisionState::default();
    for &step in steps {
        match step {
            ProvisionStep::FuseVbootKey => {}
            ProvisionStep::FusePermAttr => {
                if !state.bootloader_locked || state.avb_perm_attr_set {
                    return false;
                }
            }
            ProvisionStep::LockAvb => {
                if !state.bootloader_locked || !state.avb_perm_attr_set {
                    return false;
                }
            }
            ProvisionStep::UnlockAvb => {}
            ProvisionStep::ProvisionProduct => {
                if !state.bootloader_locked
                    || !state.avb_perm_attr_set
                    || state.product_provisioned
                {
                    return false;
                }
            }
            ProvisionStep::ProvisionSom => {
                if !state.bootloader_locked || state.som_provisioned {
                    return false;
                }
            }
        }
        apply(step, &mut state);
    }
    true
}

/// The facets a device ends with after the whole sequence runs.
pub fn project_final(mut state: ProvisionState, steps: &[ProvisionStep]) -> ProvisionState {
    for &step in steps {
        apply(step, &mut state);
    }
    state
}

/// A target is finished when running the sequence would not change it,
/// which also skips steps a device already satisfied.
pub fn is_finished(state: &ProvisionState, steps: &[ProvisionStep]) -> bool {
    project_final(*state, steps) == *state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(steps: &[&str]) -> Vec<String> {
        steps.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_known_step_names() {
        let parsed =
            parse_steps(&names(&["FuseVbootKey", "FusePermAttr", "LockAvb"])).expect("parse");
        assert_eq!(
            parsed,
            vec![
                ProvisionStep::FuseVbootKey,
                ProvisionStep::FusePermAttr,
                ProvisionStep::LockAvb
            ]
        );
    }

    #[test]
    fn unknown_token_is_a_syntax_error() {
        let result = parse_steps(&names(&["FuseVbootKey", "FlashRecovery"]));
        assert_eq!(result.err().as_deref(), Some("FlashRecovery"));
    }

    #[test]
    fn default_sequences_are_secure() {
        assert!(validate_security(&DEFAULT_PRODUCT_STEPS));
        assert!(validate_security(&DEFAULT_SOM_STEPS));
    }

    #[test]
    fn out_of_order_sequences_are_rejected() {
        use ProvisionStep::*;
        // Perm attr before the vboot key.
        assert!(!validate_security(&[FusePermAttr, FuseVbootKey]));
        // Lock before the attribute fuse.
        assert!(!validate_security(&[FuseVbootKey, LockAvb]));
        // Provision before the attribute fuse.
        assert!(!validate_security(&[FuseVbootKey, ProvisionProduct]));
        // SoM provisioning without the vboot key.
        assert!(!validate_security(&[ProvisionSom]));
        // Repeated one-shot steps.
        assert!(!validate_security(&[FuseVbootKey, FusePermAttr, FusePermAttr]));
        assert!(!validate_security(&[
            FuseVbootKey,
            FusePermAttr,
            ProvisionProduct,
            ProvisionProduct
        ]));
        assert!(!validate_security(&[FuseVbootKey, ProvisionSom, ProvisionSom]));
    }

    #[test]
    fn unlock_is_always_permitted_and_clears_the_lock() {
        use ProvisionStep::*;
        assert!(validate_security(&[UnlockAvb]));
        assert!(validate_security(&[
            FuseVbootKey,
            FusePermAttr,
            LockAvb,
            ProvisionProduct,
            UnlockAvb
        ]));
        // Unlock re-arms a later lock.
        assert!(validate_security(&[
            FuseVbootKey,
            FusePermAttr,
            LockAvb,
            UnlockAvb,
            LockAvb
        ]));
    }

    #[test]
    fn completion_predicate_skips_satisfied_steps() {
        let steps = DEFAULT_PRODUCT_STEPS;

        let fresh = ProvisionState::default();
        assert!(!is_finished(&fresh, &steps));

        let done = ProvisionState {
            bootloader_locked: true,
            avb_perm_attr_set: true,
            avb_locked: true,
            product_provisioned: true,
            som_provisioned: false,
        };
        assert!(is_finished(&done, &steps));

        let partial = ProvisionState {
            bootloader_locked: true,
            avb_perm_attr_set: true,
            ..ProvisionState::default()
        };
        assert!(!is_finished(&partial, &steps));
    }

    #[test]
    fn unlock_sequences_finish_with_lock_cleared() {
        use ProvisionStep::*;
        let steps = [FuseVbootKey, FusePermAttr, LockAvb, ProvisionProduct, UnlockAvb];
        let state = ProvisionState {
            bootloader_locked: true,
            avb_perm_attr_set: true,
            avb_locked: false,
            product_provisioned: true,
            som_provisioned: false,
        };
        assert!(is_finished(&state, &steps));

        let still_locked = ProvisionState {
            avb_locked: true,
            ..state
        };
        assert!(!is_finished(&still_locked, &steps));
    }

    #[test]
    fn projection_matches_stepwise_application() {
        use ProvisionStep::*;
        let steps = [FuseVbootKey, FusePermAttr, LockAvb, UnlockAvb, ProvisionSom];
        let mut stepwise = ProvisionState::default();
        for &step in &steps {
            apply(step, &mut stepwise);
        }
        assert_eq!(project_final(ProvisionState::default(), &steps), stepwise);
        assert!(is_finished(&stepwise, &steps));
    }
}
