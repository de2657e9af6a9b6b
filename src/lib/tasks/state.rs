use super::types::State;

/// Destination states reachable from `src`. Terminal states reach nothing.
pub fn transitions(src: &State) -> &'static [State] {
    match src {
        State::Pending => &[State::Scheduled],
        State::Scheduled => &[State::Scheduled, State::Running, State::Failed],
        State::Running => &[State::Running, State::Completed, State::Failed],
        State::Completed | State::Failed | State::Stopped => &[],
    }
}

pub fn valid_state_transition(src: &State, dst: &State) -> bool {
    transitions(src).contains(dst)
}

/// Same check over raw state names. Any name outside the enumeration is
/// never a valid endpoint.
#[cfg(test)]
pub fn valid_state_transition_name(src: &str, dst: &str) -> bool {
    match (src.parse::<State>(), dst.parse::<State>()) {
        (Ok(src), Ok(dst)) => valid_state_transition(&src, &dst),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGAL: &[(State, State)] = &[
        (State::Pending, State::Scheduled),
        (State::Scheduled, State::Scheduled),
        (State::Scheduled, State::Running),
        (State::Scheduled, State::Failed),
        (State::Running, State::Running),
        (State::Running, State::Completed),
        (State::Running, State::Failed),
    ];

    #[test]
    fn only_table_pairs_are_legal() {
        for src in State::ALL {
            for dst in State::ALL {
                let expected = LEGAL.contains(&(src, dst));
                assert_eq!(
                    valid_state_transition(&src, &dst),
                    expected,
                    "{} -> {}",
                    src,
                    dst
                );
            }
        }
    }

    #[test]
    fn terminal_states_go_nowhere() {
        for src in [State::Completed, State::Failed, State::Stopped] {
            assert!(transitions(&src).is_empty());
        }
    }

    #[test]
    fn garbage_names_are_invalid() {
        assert!(valid_state_transition_name("Running", "Completed"));
        assert!(!valid_state_transition_name("Bogus", "Scheduled"));
        assert!(!valid_state_transition_name("Pending", "scheduled"));
        assert!(!valid_state_transition_name("", ""));
    }
}
