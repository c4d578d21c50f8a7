//! Mode resolution tests
//!
//! `resolve_mode` is a pure function: the same inputs always give the same
//! mode, and the arbiter notifies once per distinct result.

use pulse_core::mode::{resolve_mode, BroadcastFlags, ModeArbiter, ModeInputs};
use pulse_core::models::{Mode, ModeKind, RemoteMode};
use pulse_test_utils::{drain, session, user};
use proptest::prelude::*;

fn mode_kind() -> impl Strategy<Value = ModeKind> {
    prop_oneof![
        Just(ModeKind::Solo),
        Just(ModeKind::Paired),
        Just(ModeKind::GroupHost),
        Just(ModeKind::GroupViewer),
    ]
}

fn remote_mode() -> impl Strategy<Value = Option<RemoteMode>> {
    prop_oneof![
        Just(None),
        Just(Some(RemoteMode::Solo)),
        Just(Some(RemoteMode::Paired)),
        Just(Some(RemoteMode::GroupHost {
            session_id: session("room-1")
        })),
        Just(Some(RemoteMode::GroupViewer {
            session_id: session("room-2")
        })),
    ]
}

prop_compose! {
    fn mode_inputs()(
        local_role in mode_kind(),
        remote_mode in remote_mode(),
        has_partner in any::<bool>(),
        has_host in any::<bool>(),
        own_broadcasting in any::<bool>(),
        target_broadcasting in any::<bool>(),
    ) -> ModeInputs {
        ModeInputs {
            local_role,
            remote_mode,
            selected_partner: has_partner.then(|| user("partner")),
            target_host: has_host.then(|| user("host")),
            flags: BroadcastFlags { own_broadcasting, target_broadcasting },
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

    #[test]
    fn prop_resolution_is_pure(inputs in mode_inputs()) {
        let first = resolve_mode(&inputs);
        let second = resolve_mode(&inputs.clone());
        prop_assert_eq!(&first, &second);

        // Group host needs the own broadcast flag; group viewer a live target
        match &first {
            Mode::GroupHost => prop_assert!(inputs.flags.own_broadcasting),
            Mode::GroupViewer { host_id } => {
                prop_assert!(inputs.flags.target_broadcasting);
                prop_assert_eq!(Some(host_id), inputs.target_host.as_ref());
            }
            Mode::Paired { partner_id } => {
                prop_assert_eq!(Some(partner_id), inputs.selected_partner.as_ref());
            }
            Mode::Solo => {}
        }
    }

    #[test]
    fn prop_arbiter_notifies_only_on_change(sequence in proptest::collection::vec(mode_inputs(), 1..16)) {
        let mut arbiter = ModeArbiter::new();
        let mut rx = arbiter.subscribe();
        let mut expected = Vec::new();

        for inputs in &sequence {
            let resolved = resolve_mode(inputs);
            if expected.last() != Some(&resolved) {
                expected.push(resolved);
            }
            arbiter.update(inputs);
        }

        prop_assert_eq!(drain(&mut rx), expected);
    }
}

/// The announced mode wins over the configured role once known.
#[test]
fn test_announced_mode_overrides_role() {
    let mut inputs = ModeInputs::new(ModeKind::GroupHost);
    inputs.flags.own_broadcasting = true;
    assert_eq!(resolve_mode(&inputs), Mode::GroupHost);

    inputs.remote_mode = Some(RemoteMode::Solo);
    assert_eq!(resolve_mode(&inputs), Mode::Solo);
}
